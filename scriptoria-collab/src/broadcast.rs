//! Room fan-out for the relay server.
//!
//! All peers in the same session share one broadcast channel of
//! pre-encoded JSON frames. Lagging peers drop messages once their
//! receiver buffer fills (backpressure).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
}

/// A broadcast group for a single session room.
///
/// Frames are relayed to every subscriber, the sender included —
/// filtering own frames is the consumer's job.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<String>>,
    /// Connected peers: connection id → identified user id, if any.
    peers: Arc<RwLock<HashMap<Uuid, Option<String>>>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a slow peer can fall behind
    /// before it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
            }),
        }
    }

    /// Add a connection and return its frame receiver.
    pub async fn add_peer(&self, conn_id: Uuid) -> broadcast::Receiver<Arc<String>> {
        self.peers.write().await.insert(conn_id, None);
        self.sender.subscribe()
    }

    /// Record the user id a connection announced.
    pub async fn identify(&self, conn_id: Uuid, user_id: impl Into<String>) {
        if let Some(slot) = self.peers.write().await.get_mut(&conn_id) {
            *slot = Some(user_id.into());
        }
    }

    /// Remove a connection; returns its identified user id, if any.
    pub async fn remove_peer(&self, conn_id: &Uuid) -> Option<String> {
        self.peers.write().await.remove(conn_id).flatten()
    }

    /// Fan a pre-encoded frame out to every subscriber. Lock-free.
    ///
    /// Returns the number of receivers the frame reached.
    pub fn broadcast(&self, frame: Arc<String>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, conn_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(conn_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<String>> {
        self.sender.subscribe()
    }
}

/// Maps session ids to broadcast groups so messages stay isolated
/// between sessions.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the room for a session.
    pub async fn get_or_create(&self, session_id: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock.
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(session_id) {
                return room.clone();
            }
        }

        // Slow path: write lock, double-checked.
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(session_id) {
            return room.clone();
        }
        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(session_id.to_string(), room.clone());
        room
    }

    /// Remove a room once its last peer is gone.
    pub async fn remove_if_empty(&self, session_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(session_id) {
            if room.peer_count().await == 0 {
                rooms.remove(session_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
