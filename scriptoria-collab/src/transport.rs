//! Persistent WebSocket transport with reconnection and liveness tracking.
//!
//! Provides:
//! - Connection lifecycle (connect with hard timeout, clean disconnect,
//!   exponential-backoff reconnection up to an attempt cap)
//! - Heartbeat-based latency measurement
//! - A bounded outbound queue that survives transient disconnects
//!
//! The transport owns exactly one logical connection. It is constructed
//! explicitly and passed by handle to the layers above it; there is no
//! module-level instance.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::{MessageKind, ProtocolError, WireMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Boxed, `Send` future — used to give the mutually recursive
/// `attach`/`reconnect_loop` pair concrete (non-opaque) return types, so
/// their `Send`-ness can be determined without an inference cycle.
type BoxFut = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL of the collaboration channel.
    pub url: String,
    /// Stamped onto outbound envelopes.
    pub user_id: Option<String>,
    /// Stamped onto outbound envelopes.
    pub session_id: Option<String>,
    /// Interval between heartbeat probes while connected.
    pub heartbeat_interval: Duration,
    /// Base delay for reconnection backoff.
    pub reconnect_interval: Duration,
    /// Consecutive failures tolerated before giving up.
    pub max_reconnect_attempts: u32,
    /// Hard deadline for a single connection attempt.
    pub connect_timeout: Duration,
    /// Outbound queue capacity while disconnected.
    pub max_queue: usize,
    /// Whether unclean closes trigger the reconnection state machine.
    pub auto_reconnect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            user_id: None,
            session_id: None,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(10),
            max_queue: 100,
            auto_reconnect: true,
        }
    }
}

impl TransportConfig {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Connection state snapshot, read-only to observers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub is_reconnecting: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub latency: Option<Duration>,
}

/// Events emitted by the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Initial connection established.
    Connected,
    /// Connection lost or closed.
    Disconnected,
    /// Connection re-established after an unclean close.
    Reconnected,
    /// Attempt cap exhausted; terminal until `connect()` is called again.
    ReconnectFailed,
    /// Inbound envelope, in delivery order.
    Message(WireMessage),
    /// Connection state transition.
    StateChange(ConnectionState),
    /// Connection-level error; does not itself force a reconnect.
    Error(String),
}

/// Transport errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("websocket error: {0}")]
    Socket(String),
    #[error("transport is already connected")]
    AlreadyConnected,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Counters for monitoring transport health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_queued: u64,
    pub messages_dropped: u64,
    pub reconnects: u64,
}

struct AtomicTransportStats {
    sent: AtomicU64,
    received: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    reconnects: AtomicU64,
}

impl AtomicTransportStats {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            messages_queued: self.queued.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Bounded FIFO queue for envelopes sent while disconnected.
///
/// Exceeding the cap evicts the oldest entry; presence and heartbeat data
/// is stale-tolerant, so drop-oldest is the backpressure policy. Callers
/// routing durable edits through the transport need their own
/// acknowledgment on top.
pub struct MessageQueue {
    queue: VecDeque<WireMessage>,
    max_size: usize,
}

impl MessageQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(128)),
            max_size,
        }
    }

    /// Enqueue a message, evicting the oldest entry when full.
    ///
    /// Returns the evicted message, if any.
    pub fn push(&mut self, msg: WireMessage) -> Option<WireMessage> {
        let evicted = if self.queue.len() >= self.max_size {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(msg);
        evicted
    }

    /// Drain all queued messages in FIFO order.
    pub fn drain(&mut self) -> Vec<WireMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Delay before the Nth retry (1-indexed): `base * 2^(N-1)`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1).min(16))
}

struct Shared {
    config: TransportConfig,
    state: RwLock<ConnectionState>,
    queue: Mutex<MessageQueue>,
    outgoing: RwLock<Option<mpsc::Sender<Message>>>,
    event_tx: mpsc::Sender<TransportEvent>,
    /// Set by `disconnect()`; suppresses reconnection for that close only.
    clean_close: AtomicBool,
    last_heartbeat_sent: Mutex<Option<Instant>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: AtomicTransportStats,
}

/// The collaboration transport.
pub struct CollabTransport {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
}

impl CollabTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let max_queue = config.max_queue;
        Self {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(ConnectionState::default()),
                queue: Mutex::new(MessageQueue::new(max_queue)),
                outgoing: RwLock::new(None),
                event_tx,
                clean_close: AtomicBool::new(false),
                last_heartbeat_sent: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                stats: AtomicTransportStats::new(),
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    /// Open the connection. Resolves once the socket handshake completes,
    /// or fails after `connect_timeout`.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.shared.state.read().await.is_connected {
            return Err(TransportError::AlreadyConnected);
        }
        self.shared.clean_close.store(false, Ordering::SeqCst);

        let ws = dial(&self.shared.config).await?;
        attach(self.shared.clone(), ws, false).await;
        Ok(())
    }

    /// Close the connection cleanly.
    ///
    /// Cancels all timers, sends a normal close frame, resets the
    /// connection state, and suppresses reconnection for this close only.
    pub async fn disconnect(&self) {
        self.shared.clean_close.store(true, Ordering::SeqCst);

        for task in self.shared.tasks.lock().await.drain(..) {
            task.abort();
        }

        if let Some(tx) = self.shared.outgoing.write().await.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            };
            let _ = tx.send(Message::Close(Some(frame))).await;
        }

        let snapshot = {
            let mut st = self.shared.state.write().await;
            st.is_connected = false;
            st.is_reconnecting = false;
            st.reconnect_attempts = 0;
            st.clone()
        };
        let _ = self.shared.event_tx.send(TransportEvent::Disconnected).await;
        let _ = self
            .shared
            .event_tx
            .send(TransportEvent::StateChange(snapshot))
            .await;
        log::info!("transport disconnected");
    }

    /// Send an envelope of the given type.
    ///
    /// Returns `true` if the message was transmitted immediately; `false`
    /// if it was queued for later delivery (disconnected, or the
    /// transmission failed).
    pub async fn send(&self, kind: impl Into<String>, payload: serde_json::Value) -> bool {
        let msg = WireMessage::new(kind, payload).with_sender(
            self.shared.config.user_id.clone(),
            self.shared.config.session_id.clone(),
        );
        self.send_message(msg).await
    }

    /// Send a pre-built envelope. Same delivery contract as [`send`].
    ///
    /// [`send`]: CollabTransport::send
    pub async fn send_message(&self, msg: WireMessage) -> bool {
        let connected = self.shared.state.read().await.is_connected;
        if connected && send_frame(&self.shared, &msg).await {
            return true;
        }

        let mut queue = self.shared.queue.lock().await;
        if queue.push(msg).is_some() {
            self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("outbound queue full, evicted oldest message");
        }
        self.shared.stats.queued.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Current connection state snapshot.
    pub async fn state(&self) -> ConnectionState {
        self.shared.state.read().await.clone()
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> TransportStats {
        self.shared.stats.snapshot()
    }

    /// Number of messages waiting for the next connection.
    pub async fn queued_len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }
}

async fn dial(config: &TransportConfig) -> Result<WsStream, TransportError> {
    let attempt = connect_async(config.url.as_str());
    match tokio::time::timeout(config.connect_timeout, attempt).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(TransportError::Socket(e.to_string())),
        Err(_) => Err(TransportError::ConnectTimeout(config.connect_timeout)),
    }
}

/// Encode and transmit one frame. Returns `false` if the writer is gone
/// or encoding failed.
async fn send_frame(shared: &Arc<Shared>, msg: &WireMessage) -> bool {
    let tx = match &*shared.outgoing.read().await {
        Some(tx) => tx.clone(),
        None => return false,
    };
    let text = match msg.encode() {
        Ok(t) => t,
        Err(e) => {
            log::warn!("failed to encode outbound message: {e}");
            let _ = shared
                .event_tx
                .send(TransportEvent::Error(e.to_string()))
                .await;
            return false;
        }
    };
    if tx.send(Message::Text(text.into())).await.is_ok() {
        shared.stats.sent.fetch_add(1, Ordering::Relaxed);
        true
    } else {
        false
    }
}

/// Wire a freshly opened socket: writer, reader, and heartbeat tasks,
/// then flush the outbound queue in FIFO order.
///
/// Returns a boxed `Send` future (rather than an opaque `async fn` type) so
/// that its mutual recursion with [`reconnect_loop`] has a concrete type and
/// its `Send`-ness can be resolved without an auto-trait inference cycle.
fn attach(shared: Arc<Shared>, ws: WsStream, reconnected: bool) -> BoxFut {
    Box::pin(async move {
        let (mut ws_sink, ws_reader) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        *shared.outgoing.write().await = Some(out_tx);

        // Writer: forward the outgoing channel to the socket.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let snapshot = {
            let mut st = shared.state.write().await;
            st.is_connected = true;
            st.is_reconnecting = false;
            st.reconnect_attempts = 0;
            st.last_connected = Some(Utc::now());
            st.clone()
        };
        let event = if reconnected {
            TransportEvent::Reconnected
        } else {
            TransportEvent::Connected
        };
        let _ = shared.event_tx.send(event).await;
        let _ = shared
            .event_tx
            .send(TransportEvent::StateChange(snapshot))
            .await;

        // Flush messages queued while disconnected.
        let pending = shared.queue.lock().await.drain();
        if !pending.is_empty() {
            log::info!("flushing {} queued messages", pending.len());
            for msg in pending {
                if !send_frame(&shared, &msg).await {
                    shared.queue.lock().await.push(msg);
                }
            }
        }

        let heartbeat = tokio::spawn(heartbeat_loop(shared.clone()));
        let reader = tokio::spawn(reader_loop(shared.clone(), ws_reader));

        let mut tasks = shared.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(heartbeat);
        tasks.push(reader);
    })
}

/// Exponential-backoff reconnection, up to the attempt cap.
///
/// Boxed like [`attach`] to break the mutual-recursion auto-trait cycle.
fn reconnect_loop(shared: Arc<Shared>) -> BoxFut {
    Box::pin(async move {
        let config = shared.config.clone();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let snapshot = {
                let mut st = shared.state.write().await;
                st.is_reconnecting = true;
                st.reconnect_attempts = attempt;
                st.clone()
            };
            let _ = shared
                .event_tx
                .send(TransportEvent::StateChange(snapshot))
                .await;

            let delay = backoff_delay(config.reconnect_interval, attempt);
            log::info!(
                "reconnect attempt {attempt}/{} in {delay:?}",
                config.max_reconnect_attempts
            );
            tokio::time::sleep(delay).await;

            if shared.clean_close.load(Ordering::SeqCst) {
                return;
            }

            match dial(&config).await {
                Ok(ws) => {
                    shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    attach(shared.clone(), ws, true).await;
                    return;
                }
                Err(e) => {
                    log::warn!("reconnect attempt {attempt} failed: {e}");
                    if attempt >= config.max_reconnect_attempts {
                        let snapshot = {
                            let mut st = shared.state.write().await;
                            st.is_reconnecting = false;
                            st.clone()
                        };
                        let _ = shared.event_tx.send(TransportEvent::ReconnectFailed).await;
                        let _ = shared
                            .event_tx
                            .send(TransportEvent::StateChange(snapshot))
                            .await;
                        log::warn!("giving up after {attempt} reconnect attempts");
                        return;
                    }
                }
            }
        }
    })
}

/// Send a heartbeat probe every `heartbeat_interval` while connected.
async fn heartbeat_loop(shared: Arc<Shared>) {
    let interval = shared.config.heartbeat_interval;
    loop {
        tokio::time::sleep(interval).await;
        if !shared.state.read().await.is_connected {
            break;
        }
        *shared.last_heartbeat_sent.lock().await = Some(Instant::now());
        let probe = WireMessage::heartbeat().with_sender(
            shared.config.user_id.clone(),
            shared.config.session_id.clone(),
        );
        if !send_frame(&shared, &probe).await {
            break;
        }
        log::trace!("heartbeat sent");
    }
}

/// Process inbound frames until the connection drops, then hand off to
/// the reconnection state machine unless the close was clean.
async fn reader_loop(
    shared: Arc<Shared>,
    mut reader: futures_util::stream::SplitStream<WsStream>,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match WireMessage::decode(text.as_str()) {
                Ok(msg) => {
                    shared.stats.received.fetch_add(1, Ordering::Relaxed);
                    handle_inbound(&shared, &msg).await;
                    let _ = shared.event_tx.send(TransportEvent::Message(msg)).await;
                }
                Err(e) => {
                    // Malformed frames are discarded, never fatal.
                    log::warn!("discarding malformed frame: {e}");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                let _ = shared
                    .event_tx
                    .send(TransportEvent::Error(e.to_string()))
                    .await;
                break;
            }
        }
    }

    *shared.outgoing.write().await = None;

    if shared.clean_close.load(Ordering::SeqCst) {
        // disconnect() already reported the state transition.
        return;
    }

    let snapshot = {
        let mut st = shared.state.write().await;
        st.is_connected = false;
        st.clone()
    };
    let _ = shared.event_tx.send(TransportEvent::Disconnected).await;
    let _ = shared
        .event_tx
        .send(TransportEvent::StateChange(snapshot))
        .await;
    log::info!("connection lost");

    if shared.config.auto_reconnect {
        let handle = tokio::spawn(reconnect_loop(shared.clone()));
        shared.tasks.lock().await.push(handle);
    }
}

async fn handle_inbound(shared: &Arc<Shared>, msg: &WireMessage) {
    match msg.reserved() {
        Some(MessageKind::Heartbeat) => {
            // Echo immediately so the remote can measure latency.
            if let Ok(probe) = msg.heartbeat_payload() {
                let response = WireMessage::heartbeat_response(probe.timestamp).with_sender(
                    shared.config.user_id.clone(),
                    shared.config.session_id.clone(),
                );
                send_frame(shared, &response).await;
            }
        }
        Some(MessageKind::HeartbeatResponse) => {
            if let Some(sent_at) = shared.last_heartbeat_sent.lock().await.take() {
                let latency = sent_at.elapsed();
                let snapshot = {
                    let mut st = shared.state.write().await;
                    st.latency = Some(latency);
                    st.clone()
                };
                let _ = shared
                    .event_tx
                    .send(TransportEvent::StateChange(snapshot))
                    .await;
                log::trace!("heartbeat latency {latency:?}");
            }
        }
        _ => {}
    }
}
