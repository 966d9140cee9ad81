//! Relay server with session-based room routing.
//!
//! ```text
//! Client A ──┐
//!             ├── Room (sessionId) ── BroadcastGroup
//! Client B ──┘           │
//!                        ├── heartbeat → heartbeat_response (echo)
//!                        ├── user_presence → user_joined announce
//!                        └── everything else → fan-out to the room
//! ```
//!
//! The relay holds no document state: it routes envelopes between the
//! peers of a session and answers liveness probes. A peer's room is
//! fixed by the `sessionId` of its first envelope (falling back to the
//! configured default room).

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::protocol::{MessageKind, WireMessage};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Maximum peers per room.
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room.
    pub broadcast_capacity: usize,
    /// Room for envelopes that carry no session id.
    pub default_room: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            default_room: "main".to_string(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Run the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: RelayConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("websocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let conn_id = Uuid::new_v4();
        let mut session_id: Option<String> = None;
        let mut user_id: Option<String> = None;
        let mut room: Option<Arc<BroadcastGroup>> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<String>>> = None;

        loop {
            tokio::select! {
                // Inbound WebSocket frame.
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            let msg = match WireMessage::decode(text.as_str()) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                            }

                            // First envelope fixes the peer's room.
                            if room.is_none() {
                                let session = msg
                                    .session_id
                                    .clone()
                                    .unwrap_or_else(|| config.default_room.clone());
                                let group = rooms.get_or_create(&session).await;
                                if group.peer_count().await >= config.max_peers_per_room {
                                    log::warn!("room {session} full, rejecting {addr}");
                                    let _ = ws_sender.send(Message::Close(None)).await;
                                    break;
                                }
                                broadcast_rx = Some(group.add_peer(conn_id).await);
                                {
                                    let mut s = stats.write().await;
                                    s.active_rooms = rooms.room_count().await;
                                }
                                log::info!("connection {conn_id} joined room {session}");
                                session_id = Some(session);
                                room = Some(group);
                            }
                            let Some(group) = room.as_ref() else {
                                continue;
                            };

                            match msg.reserved() {
                                Some(MessageKind::Heartbeat) => {
                                    // Answer directly so the sender can
                                    // measure round-trip latency.
                                    if let Ok(probe) = msg.heartbeat_payload() {
                                        let response =
                                            WireMessage::heartbeat_response(probe.timestamp);
                                        let frame = response.encode()?;
                                        ws_sender.send(Message::Text(frame.into())).await?;
                                    }
                                }
                                Some(MessageKind::HeartbeatResponse) => {
                                    // Liveness bookkeeping only; not relayed.
                                    log::trace!("heartbeat response from {conn_id}");
                                }
                                Some(MessageKind::UserPresence) => {
                                    // Join announcement: remember the user
                                    // and notify the room explicitly.
                                    if let Some(uid) = msg.user_id.clone() {
                                        group.identify(conn_id, uid.clone()).await;
                                        user_id = Some(uid.clone());
                                        log::info!("user {uid} announced in room");
                                    }
                                    relay(group, &msg)?;
                                    let joined = WireMessage::new(
                                        MessageKind::UserJoined.as_str(),
                                        msg.payload.clone(),
                                    );
                                    relay(group, &joined)?;
                                }
                                _ => {
                                    // Presence updates, cursors, and
                                    // adapter-defined types all fan out.
                                    if user_id.is_none() {
                                        if let Some(uid) = msg.user_id.clone() {
                                            group.identify(conn_id, uid.clone()).await;
                                            user_id = Some(uid);
                                        }
                                    }
                                    relay(group, &msg)?;
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::warn!("websocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Frames fanned out by peers in the same room.
                frame = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(text) => {
                            // Don't echo a peer's own frames back.
                            if let (Some(uid), Ok(msg)) =
                                (user_id.as_deref(), WireMessage::decode(&text))
                            {
                                if msg.user_id.as_deref() == Some(uid) {
                                    continue;
                                }
                            }
                            ws_sender
                                .send(Message::Text(text.as_str().to_string().into()))
                                .await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("connection {conn_id} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: leave the room, announce the departure.
        if let (Some(group), Some(session)) = (room, session_id) {
            let left_user = group.remove_peer(&conn_id).await.or(user_id);
            if let Some(uid) = left_user {
                let leave = WireMessage::new(
                    MessageKind::UserLeft.as_str(),
                    serde_json::json!({ "userId": uid }),
                );
                let _ = relay(&group, &leave);
                log::info!("user {uid} left room {session}");
            }
            rooms.remove_if_empty(&session).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms.room_count().await;
        }

        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

fn relay(
    group: &BroadcastGroup,
    msg: &WireMessage,
) -> Result<usize, crate::protocol::ProtocolError> {
    let frame = Arc::new(msg.encode()?);
    Ok(group.broadcast(frame))
}
