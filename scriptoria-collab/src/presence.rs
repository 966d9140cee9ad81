//! Presence tracking for collaborators on a shared document.
//!
//! Publishes the local participant's status, location, and cursor, and
//! maintains an eventually-accurate roster of everyone else's, with
//! minimal network chatter:
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceTracker::update_cursor()
//!       │  (100ms throttle, latest value wins)
//!       ▼
//! cursor_update envelope
//!       │
//!       ▼   (transport broadcast)
//! Remote PresenceTracker roster
//! ```
//!
//! Status, location, and profile updates are deliberately un-throttled —
//! callers invoke them only on meaningful transitions. A periodic
//! self-announce runs while connected so late joiners converge.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::protocol::{MessageKind, WireMessage};
use crate::transport::{CollabTransport, TransportEvent};

/// Collaborator availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    #[default]
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        }
    }
}

/// Where in the document tree a collaborator is working.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentLocation {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chapter_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scene_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub position: Option<u64>,
}

impl DocumentLocation {
    /// The (project, chapter, scene) triple used for location queries.
    fn triple(&self) -> (&Option<String>, &Option<String>, &Option<String>) {
        (&self.project_id, &self.chapter_id, &self.scene_id)
    }
}

/// Selected text span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: u64,
    pub end: u64,
}

/// Cursor position in editor coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    pub x: f32,
    pub y: f32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub selection: Option<SelectionRange>,
}

/// Payload of `cursor_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorUpdatePayload {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub x: f32,
    pub y: f32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub selection: Option<SelectionRange>,
}

/// One collaborator's live state. Exactly one record per user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub avatar: Option<String>,
    pub status: PresenceStatus,
    /// ISO-8601 on the wire.
    pub last_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_location: Option<DocumentLocation>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cursor: Option<CursorState>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// The local participant's identity, supplied at initialization.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub user_id: String,
    pub username: String,
    pub avatar: Option<String>,
}

/// Partial presence update merged into the local record.
#[derive(Debug, Clone, Default)]
pub struct PresencePatch {
    pub username: Option<String>,
    pub avatar: Option<String>,
    pub status: Option<PresenceStatus>,
    pub current_location: Option<DocumentLocation>,
    pub cursor: Option<CursorState>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Events emitted by the tracker.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// A previously unknown collaborator appeared.
    UserJoined(UserPresence),
    /// A known collaborator's record changed.
    UserUpdated(UserPresence),
    /// A collaborator left the session.
    UserLeft(String),
    /// A known collaborator's cursor moved.
    CursorMoved {
        user_id: String,
        cursor: CursorState,
    },
    /// Batch change, e.g. everyone marked offline on disconnect.
    UsersUpdated(Vec<UserPresence>),
}

/// Tracker timing knobs.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Periodic self-announce interval while connected.
    pub announce_interval: Duration,
    /// Minimum gap between cursor broadcasts.
    pub cursor_throttle: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(15),
            cursor_throttle: Duration::from_millis(100),
        }
    }
}

struct CursorThrottle {
    last_broadcast: Option<Instant>,
    pending: Option<CursorState>,
    flush_task: Option<JoinHandle<()>>,
}

struct PresenceInner {
    config: PresenceConfig,
    local_user_id: RwLock<Option<String>>,
    /// Roster keyed by user id; includes the local record.
    roster: RwLock<HashMap<String, UserPresence>>,
    throttle: Mutex<CursorThrottle>,
    announce_task: Mutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::Sender<PresenceEvent>,
}

/// The presence tracker.
pub struct PresenceTracker {
    transport: Arc<CollabTransport>,
    inner: Arc<PresenceInner>,
    event_rx: Option<mpsc::Receiver<PresenceEvent>>,
}

impl PresenceTracker {
    pub fn new(transport: Arc<CollabTransport>) -> Self {
        Self::with_config(transport, PresenceConfig::default())
    }

    pub fn with_config(transport: Arc<CollabTransport>, config: PresenceConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            transport,
            inner: Arc::new(PresenceInner {
                config,
                local_user_id: RwLock::new(None),
                roster: RwLock::new(HashMap::new()),
                throttle: Mutex::new(CursorThrottle {
                    last_broadcast: None,
                    pending: None,
                    flush_task: None,
                }),
                announce_task: Mutex::new(None),
                event_tx,
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<PresenceEvent>> {
        self.event_rx.take()
    }

    /// Set the local participant and start the periodic self-announce.
    ///
    /// If the transport is already connected, the join announcement
    /// (`user_presence`) goes out immediately.
    pub async fn initialize(&self, identity: LocalIdentity) {
        let record = UserPresence {
            user_id: identity.user_id.clone(),
            username: identity.username,
            avatar: identity.avatar,
            status: PresenceStatus::Online,
            last_seen: Utc::now(),
            current_location: None,
            cursor: None,
            metadata: None,
        };

        *self.inner.local_user_id.write().await = Some(identity.user_id.clone());
        self.inner
            .roster
            .write()
            .await
            .insert(identity.user_id.clone(), record.clone());

        if self.transport.state().await.is_connected {
            broadcast_record(&self.transport, MessageKind::UserPresence, &record).await;
        }

        let mut guard = self.inner.announce_task.lock().await;
        if let Some(task) = guard.take() {
            task.abort();
        }
        *guard = Some(tokio::spawn(announce_loop(
            self.inner.clone(),
            self.transport.clone(),
        )));
        log::info!("presence initialized for {}", identity.user_id);
    }

    /// Merge a partial update into the local record, stamp `last_seen`,
    /// and broadcast the full record. Not throttled.
    pub async fn update_presence(&self, patch: PresencePatch) -> bool {
        let record = {
            let local_id = match self.inner.local_user_id.read().await.clone() {
                Some(id) => id,
                None => return false,
            };
            let mut roster = self.inner.roster.write().await;
            let Some(rec) = roster.get_mut(&local_id) else {
                return false;
            };
            if let Some(username) = patch.username {
                rec.username = username;
            }
            if let Some(avatar) = patch.avatar {
                rec.avatar = Some(avatar);
            }
            if let Some(status) = patch.status {
                rec.status = status;
            }
            if let Some(location) = patch.current_location {
                rec.current_location = Some(location);
            }
            if let Some(cursor) = patch.cursor {
                rec.cursor = Some(cursor);
            }
            if let Some(metadata) = patch.metadata {
                rec.metadata = Some(metadata);
            }
            rec.last_seen = Utc::now();
            rec.clone()
        };
        broadcast_record(&self.transport, MessageKind::PresenceUpdate, &record).await
    }

    /// Update the local document location and broadcast.
    pub async fn update_location(&self, location: DocumentLocation) -> bool {
        self.update_presence(PresencePatch {
            current_location: Some(location),
            ..PresencePatch::default()
        })
        .await
    }

    /// Update the local status and broadcast.
    pub async fn update_status(&self, status: PresenceStatus) -> bool {
        self.update_presence(PresencePatch {
            status: Some(status),
            ..PresencePatch::default()
        })
        .await
    }

    /// Update the local cursor.
    ///
    /// The roster record updates immediately; the network broadcast is
    /// throttled to one per window, a burst collapsing to the latest
    /// value flushed when the window closes.
    pub async fn update_cursor(&self, cursor: CursorState) -> bool {
        let local_id = match self.inner.local_user_id.read().await.clone() {
            Some(id) => id,
            None => return false,
        };
        {
            let mut roster = self.inner.roster.write().await;
            if let Some(rec) = roster.get_mut(&local_id) {
                rec.cursor = Some(cursor);
                rec.last_seen = Utc::now();
            }
        }

        let window = self.inner.config.cursor_throttle;
        let mut throttle = self.inner.throttle.lock().await;
        let now = Instant::now();
        let ready = throttle
            .last_broadcast
            .map_or(true, |t| now.duration_since(t) >= window);

        if ready {
            throttle.last_broadcast = Some(now);
            drop(throttle);
            send_cursor(&self.transport, &local_id, cursor).await
        } else {
            throttle.pending = Some(cursor);
            let scheduled = throttle
                .flush_task
                .as_ref()
                .map_or(false, |t| !t.is_finished());
            if !scheduled {
                let elapsed = now.duration_since(throttle.last_broadcast.unwrap_or(now));
                let delay = window.saturating_sub(elapsed);
                throttle.flush_task = Some(tokio::spawn(cursor_flush(
                    self.inner.clone(),
                    self.transport.clone(),
                    delay,
                )));
            }
            false
        }
    }

    /// Feed a transport event into the tracker.
    pub async fn handle_transport_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Message(msg) => self.handle_message(msg).await,
            TransportEvent::Disconnected => self.mark_all_offline().await,
            _ => {}
        }
    }

    /// Apply one inbound envelope to the roster.
    pub async fn handle_message(&self, msg: &WireMessage) {
        match msg.reserved() {
            Some(MessageKind::UserPresence) | Some(MessageKind::PresenceUpdate) => {
                let record: UserPresence = match serde_json::from_value(msg.payload.clone())
                {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("discarding malformed presence payload: {e}");
                        return;
                    }
                };
                self.upsert_remote(record).await;
            }
            Some(MessageKind::UserJoined) => {
                let record: UserPresence = match serde_json::from_value(msg.payload.clone())
                {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("discarding malformed join payload: {e}");
                        return;
                    }
                };
                self.upsert_remote(record).await;
            }
            Some(MessageKind::UserLeft) | Some(MessageKind::UserLeaving) => {
                if let Ok(leave) = msg.leave_payload() {
                    // An echoed goodbye must never evict the local record.
                    if self.is_local(&leave.user_id).await {
                        return;
                    }
                    let removed = {
                        let mut roster = self.inner.roster.write().await;
                        roster.remove(&leave.user_id)
                    };
                    if removed.is_some() {
                        log::debug!("{} left", leave.user_id);
                        let _ = self
                            .inner
                            .event_tx
                            .send(PresenceEvent::UserLeft(leave.user_id))
                            .await;
                    }
                }
            }
            Some(MessageKind::CursorUpdate) => {
                let payload: CursorUpdatePayload =
                    match serde_json::from_value(msg.payload.clone()) {
                        Ok(p) => p,
                        Err(e) => {
                            log::warn!("discarding malformed cursor payload: {e}");
                            return;
                        }
                    };
                if self.is_local(&payload.user_id).await {
                    return;
                }
                let cursor = CursorState {
                    x: payload.x,
                    y: payload.y,
                    selection: payload.selection,
                };
                // Cursor updates for unknown senders are dropped, not
                // speculatively inserted.
                let known = {
                    let mut roster = self.inner.roster.write().await;
                    match roster.get_mut(&payload.user_id) {
                        Some(rec) => {
                            rec.cursor = Some(cursor);
                            rec.last_seen = Utc::now();
                            true
                        }
                        None => false,
                    }
                };
                if known {
                    let _ = self
                        .inner
                        .event_tx
                        .send(PresenceEvent::CursorMoved {
                            user_id: payload.user_id,
                            cursor,
                        })
                        .await;
                }
            }
            _ => {}
        }
    }

    /// All known collaborators, local record included.
    pub async fn users(&self) -> Vec<UserPresence> {
        self.inner.roster.read().await.values().cloned().collect()
    }

    pub async fn user(&self, user_id: &str) -> Option<UserPresence> {
        self.inner.roster.read().await.get(user_id).cloned()
    }

    /// The local participant's record.
    pub async fn current_user(&self) -> Option<UserPresence> {
        let local_id = self.inner.local_user_id.read().await.clone()?;
        self.inner.roster.read().await.get(&local_id).cloned()
    }

    /// Collaborators whose (project, chapter, scene) triple matches the
    /// filter exactly.
    pub async fn users_in_location(&self, filter: &DocumentLocation) -> Vec<UserPresence> {
        let empty = DocumentLocation::default();
        self.inner
            .roster
            .read()
            .await
            .values()
            .filter(|user| {
                user.current_location
                    .as_ref()
                    .unwrap_or(&empty)
                    .triple()
                    == filter.triple()
            })
            .cloned()
            .collect()
    }

    /// Remove remote records idle for longer than `max_idle`.
    ///
    /// The local record is never evicted. Returns the evicted user ids.
    pub async fn evict_stale(&self, max_idle: Duration) -> Vec<String> {
        let local_id = self.inner.local_user_id.read().await.clone();
        let horizon = chrono::Duration::from_std(max_idle)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let now = Utc::now();

        let mut roster = self.inner.roster.write().await;
        let stale: Vec<String> = roster
            .iter()
            .filter(|(id, rec)| {
                Some(id.as_str()) != local_id.as_deref()
                    && now.signed_duration_since(rec.last_seen) > horizon
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            roster.remove(id);
            log::debug!("evicted stale presence record for {id}");
        }
        stale
    }

    /// Cancel timers and say goodbye. Required teardown step.
    pub async fn shutdown(&self) {
        if let Some(local_id) = self.inner.local_user_id.read().await.clone() {
            // Best-effort; the transport may already be gone.
            self.transport
                .send(
                    MessageKind::UserLeaving.as_str(),
                    serde_json::json!({ "userId": local_id }),
                )
                .await;
        }
        if let Some(task) = self.inner.announce_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.inner.throttle.lock().await.flush_task.take() {
            task.abort();
        }
    }

    async fn is_local(&self, user_id: &str) -> bool {
        self.inner.local_user_id.read().await.as_deref() == Some(user_id)
    }

    /// Insert or update a remote record, discriminating join from update.
    /// The local record is never overwritten by inbound updates.
    async fn upsert_remote(&self, record: UserPresence) {
        if self.is_local(&record.user_id).await {
            return;
        }
        let joined = {
            let mut roster = self.inner.roster.write().await;
            roster
                .insert(record.user_id.clone(), record.clone())
                .is_none()
        };
        let event = if joined {
            log::debug!("{} joined", record.user_id);
            PresenceEvent::UserJoined(record)
        } else {
            PresenceEvent::UserUpdated(record)
        };
        let _ = self.inner.event_tx.send(event).await;
    }

    /// Mark every remote record offline in place, then emit one batch
    /// event for the whole transition.
    async fn mark_all_offline(&self) {
        let local_id = self.inner.local_user_id.read().await.clone();
        let updated: Vec<UserPresence> = {
            let mut roster = self.inner.roster.write().await;
            roster
                .values_mut()
                .filter(|rec| Some(rec.user_id.as_str()) != local_id.as_deref())
                .map(|rec| {
                    rec.status = PresenceStatus::Offline;
                    rec.clone()
                })
                .collect()
        };
        if !updated.is_empty() {
            log::info!("marked {} collaborators offline", updated.len());
            let _ = self
                .inner
                .event_tx
                .send(PresenceEvent::UsersUpdated(updated))
                .await;
        }
    }
}

async fn broadcast_record(
    transport: &CollabTransport,
    kind: MessageKind,
    record: &UserPresence,
) -> bool {
    let payload = match serde_json::to_value(record) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("failed to serialize presence record: {e}");
            return false;
        }
    };
    transport.send(kind.as_str(), payload).await
}

async fn send_cursor(transport: &CollabTransport, user_id: &str, cursor: CursorState) -> bool {
    let payload = CursorUpdatePayload {
        user_id: user_id.to_string(),
        x: cursor.x,
        y: cursor.y,
        selection: cursor.selection,
    };
    let value = match serde_json::to_value(&payload) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("failed to serialize cursor payload: {e}");
            return false;
        }
    };
    transport
        .send(MessageKind::CursorUpdate.as_str(), value)
        .await
}

/// Re-announce the local record every interval while connected, so that
/// late-joining peers converge and silent staleness is detectable.
async fn announce_loop(inner: Arc<PresenceInner>, transport: Arc<CollabTransport>) {
    let interval = inner.config.announce_interval;
    loop {
        tokio::time::sleep(interval).await;
        if !transport.state().await.is_connected {
            continue;
        }
        let record = {
            let local_id = inner.local_user_id.read().await.clone();
            match local_id {
                Some(id) => inner.roster.read().await.get(&id).cloned(),
                None => None,
            }
        };
        if let Some(record) = record {
            broadcast_record(&transport, MessageKind::PresenceUpdate, &record).await;
        }
    }
}

/// Flush the latest pending cursor once the throttle window closes.
async fn cursor_flush(
    inner: Arc<PresenceInner>,
    transport: Arc<CollabTransport>,
    delay: Duration,
) {
    tokio::time::sleep(delay).await;
    let (local_id, pending) = {
        let mut throttle = inner.throttle.lock().await;
        throttle.last_broadcast = Some(Instant::now());
        (
            inner.local_user_id.read().await.clone(),
            throttle.pending.take(),
        )
    };
    if let (Some(local_id), Some(cursor)) = (local_id, pending) {
        send_cursor(&transport, &local_id, cursor).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportConfig;

    fn tracker() -> PresenceTracker {
        let transport = Arc::new(CollabTransport::new(TransportConfig::for_url(
            "ws://127.0.0.1:9090",
        )));
        PresenceTracker::new(transport)
    }

    fn tracker_with(config: PresenceConfig) -> PresenceTracker {
        let transport = Arc::new(CollabTransport::new(TransportConfig::for_url(
            "ws://127.0.0.1:9090",
        )));
        PresenceTracker::with_config(transport, config)
    }

    fn identity(user_id: &str, name: &str) -> LocalIdentity {
        LocalIdentity {
            user_id: user_id.into(),
            username: name.into(),
            avatar: None,
        }
    }

    fn remote(user_id: &str, name: &str) -> UserPresence {
        UserPresence {
            user_id: user_id.into(),
            username: name.into(),
            avatar: None,
            status: PresenceStatus::Online,
            last_seen: Utc::now(),
            current_location: None,
            cursor: None,
            metadata: None,
        }
    }

    fn presence_msg(record: &UserPresence) -> WireMessage {
        WireMessage::new(
            MessageKind::PresenceUpdate.as_str(),
            serde_json::to_value(record).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_initialize_sets_local_online() {
        let tracker = tracker();
        tracker.initialize(identity("alice", "Alice")).await;

        let current = tracker.current_user().await.unwrap();
        assert_eq!(current.user_id, "alice");
        assert_eq!(current.username, "Alice");
        assert_eq!(current.status, PresenceStatus::Online);
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_presence_idempotent() {
        let tracker = tracker();
        tracker.initialize(identity("alice", "Alice")).await;

        let before = tracker.current_user().await.unwrap().last_seen;
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Empty patch still stamps last_seen and re-broadcasts...
        assert!(!tracker.update_presence(PresencePatch::default()).await); // queued, not sent
        let after = tracker.current_user().await.unwrap().last_seen;
        assert!(after > before);

        // ...but never duplicates the roster entry.
        assert_eq!(tracker.users().await.len(), 1);
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_status_and_location() {
        let tracker = tracker();
        tracker.initialize(identity("alice", "Alice")).await;

        tracker.update_status(PresenceStatus::Away).await;
        let location = DocumentLocation {
            project_id: Some("p1".into()),
            chapter_id: Some("c2".into()),
            scene_id: Some("s3".into()),
            position: Some(120),
        };
        tracker.update_location(location.clone()).await;

        let current = tracker.current_user().await.unwrap();
        assert_eq!(current.status, PresenceStatus::Away);
        assert_eq!(current.current_location, Some(location));
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_inbound_join_then_update_discrimination() {
        let mut tracker = tracker();
        let mut events = tracker.take_event_rx().unwrap();
        tracker.initialize(identity("alice", "Alice")).await;

        tracker.handle_message(&presence_msg(&remote("bob", "Bob"))).await;
        match events.recv().await.unwrap() {
            PresenceEvent::UserJoined(rec) => assert_eq!(rec.user_id, "bob"),
            other => panic!("expected UserJoined, got {other:?}"),
        }

        let mut bob = remote("bob", "Bob");
        bob.status = PresenceStatus::Busy;
        tracker.handle_message(&presence_msg(&bob)).await;
        match events.recv().await.unwrap() {
            PresenceEvent::UserUpdated(rec) => {
                assert_eq!(rec.status, PresenceStatus::Busy)
            }
            other => panic!("expected UserUpdated, got {other:?}"),
        }

        assert_eq!(tracker.users().await.len(), 2);
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_inbound_never_overwrites_local() {
        let tracker = tracker();
        tracker.initialize(identity("alice", "Alice")).await;

        let mut imposter = remote("alice", "Mallory");
        imposter.status = PresenceStatus::Busy;
        tracker.handle_message(&presence_msg(&imposter)).await;

        let current = tracker.current_user().await.unwrap();
        assert_eq!(current.username, "Alice");
        assert_eq!(current.status, PresenceStatus::Online);
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_user_left_removes_record() {
        let mut tracker = tracker();
        let mut events = tracker.take_event_rx().unwrap();
        tracker.initialize(identity("alice", "Alice")).await;
        tracker.handle_message(&presence_msg(&remote("bob", "Bob"))).await;
        let _ = events.recv().await;

        let left = WireMessage::new(
            MessageKind::UserLeft.as_str(),
            serde_json::json!({"userId": "bob"}),
        );
        tracker.handle_message(&left).await;

        match events.recv().await.unwrap() {
            PresenceEvent::UserLeft(id) => assert_eq!(id, "bob"),
            other => panic!("expected UserLeft, got {other:?}"),
        }
        assert!(tracker.user("bob").await.is_none());
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_cursor_from_unknown_sender_dropped() {
        let tracker = tracker();
        tracker.initialize(identity("alice", "Alice")).await;

        let msg = WireMessage::new(
            MessageKind::CursorUpdate.as_str(),
            serde_json::json!({"userId": "ghost", "x": 1.0, "y": 2.0}),
        );
        tracker.handle_message(&msg).await;

        assert!(tracker.user("ghost").await.is_none());
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_cursor_for_known_sender_applies() {
        let mut tracker = tracker();
        let mut events = tracker.take_event_rx().unwrap();
        tracker.initialize(identity("alice", "Alice")).await;
        tracker.handle_message(&presence_msg(&remote("bob", "Bob"))).await;
        let _ = events.recv().await;

        let msg = WireMessage::new(
            MessageKind::CursorUpdate.as_str(),
            serde_json::json!({
                "userId": "bob", "x": 10.0, "y": 20.0,
                "selection": {"start": 3, "end": 9}
            }),
        );
        tracker.handle_message(&msg).await;

        match events.recv().await.unwrap() {
            PresenceEvent::CursorMoved { user_id, cursor } => {
                assert_eq!(user_id, "bob");
                assert_eq!(cursor.x, 10.0);
                assert_eq!(cursor.selection, Some(SelectionRange { start: 3, end: 9 }));
            }
            other => panic!("expected CursorMoved, got {other:?}"),
        }
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_marks_remotes_offline_once() {
        let mut tracker = tracker();
        let mut events = tracker.take_event_rx().unwrap();
        tracker.initialize(identity("alice", "Alice")).await;
        tracker.handle_message(&presence_msg(&remote("bob", "Bob"))).await;
        tracker.handle_message(&presence_msg(&remote("carol", "Carol"))).await;
        let _ = events.recv().await;
        let _ = events.recv().await;

        tracker
            .handle_transport_event(&TransportEvent::Disconnected)
            .await;

        match events.recv().await.unwrap() {
            PresenceEvent::UsersUpdated(batch) => {
                assert_eq!(batch.len(), 2);
                assert!(batch.iter().all(|u| u.status == PresenceStatus::Offline));
            }
            other => panic!("expected UsersUpdated, got {other:?}"),
        }

        // Records are retained, not deleted.
        assert!(tracker.user("bob").await.is_some());
        assert_eq!(
            tracker.user("bob").await.unwrap().status,
            PresenceStatus::Offline
        );
        // The local record keeps its status.
        assert_eq!(
            tracker.current_user().await.unwrap().status,
            PresenceStatus::Online
        );
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_users_in_location_exact_triple() {
        let tracker = tracker();
        tracker.initialize(identity("alice", "Alice")).await;

        let loc = DocumentLocation {
            project_id: Some("p1".into()),
            chapter_id: Some("c1".into()),
            scene_id: Some("s1".into()),
            position: None,
        };
        let mut bob = remote("bob", "Bob");
        bob.current_location = Some(loc.clone());
        let mut carol = remote("carol", "Carol");
        carol.current_location = Some(DocumentLocation {
            scene_id: Some("s2".into()),
            ..loc.clone()
        });
        tracker.handle_message(&presence_msg(&bob)).await;
        tracker.handle_message(&presence_msg(&carol)).await;

        let found = tracker.users_in_location(&loc).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user_id, "bob");

        // Position does not participate in the match.
        let with_position = DocumentLocation {
            position: Some(42),
            ..loc
        };
        assert_eq!(tracker.users_in_location(&with_position).await.len(), 1);
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_evict_stale_keeps_local() {
        let tracker = tracker();
        tracker.initialize(identity("alice", "Alice")).await;

        let mut old = remote("bob", "Bob");
        old.last_seen = Utc::now() - chrono::Duration::seconds(120);
        tracker.handle_message(&presence_msg(&old)).await;

        let evicted = tracker.evict_stale(Duration::from_secs(60)).await;
        assert_eq!(evicted, vec!["bob".to_string()]);
        assert!(tracker.user("bob").await.is_none());
        assert!(tracker.current_user().await.is_some());
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_cursor_throttle_collapses_burst() {
        let tracker = tracker_with(PresenceConfig {
            announce_interval: Duration::from_secs(60),
            cursor_throttle: Duration::from_millis(40),
        });
        tracker.initialize(identity("alice", "Alice")).await;

        // Disconnected transport: every broadcast lands in the queue,
        // so the queue length counts broadcasts.
        let transport = tracker.transport.clone();
        let base = transport.queued_len().await;

        // Leading edge goes out immediately.
        tracker
            .update_cursor(CursorState { x: 1.0, y: 1.0, selection: None })
            .await;
        assert_eq!(transport.queued_len().await, base + 1);

        // Burst inside the window is withheld.
        for i in 2..=5 {
            tracker
                .update_cursor(CursorState { x: i as f32, y: i as f32, selection: None })
                .await;
        }
        assert_eq!(transport.queued_len().await, base + 1);

        // The roster still has the latest value immediately.
        assert_eq!(
            tracker.current_user().await.unwrap().cursor.unwrap().x,
            5.0
        );

        // Window closes: exactly one flush with the last value.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(transport.queued_len().await, base + 2);
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_as_str() {
        assert_eq!(PresenceStatus::Online.as_str(), "online");
        assert_eq!(PresenceStatus::Away.as_str(), "away");
        assert_eq!(PresenceStatus::Busy.as_str(), "busy");
        assert_eq!(PresenceStatus::Offline.as_str(), "offline");
    }

    #[tokio::test]
    async fn test_last_seen_serializes_iso() {
        let record = remote("bob", "Bob");
        let value = serde_json::to_value(&record).unwrap();
        let last_seen = value["lastSeen"].as_str().unwrap();
        assert!(last_seen.contains('T'), "expected ISO-8601, got {last_seen}");
    }
}
