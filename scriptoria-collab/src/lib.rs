//! # scriptoria-collab — Real-time collaboration engine for Scriptoria
//!
//! Provides WebSocket-based multiplayer editing: a persistent transport
//! with reconnection and liveness tracking, a presence/cursor layer on
//! top of it, and an operational-transformation conflict resolver for
//! concurrent document edits.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌──────────────┐
//! │ CollabTransport  │ ◄─────────────────► │ RelayServer  │
//! │ (per user)       │    JSON envelopes   │ (per room)   │
//! └────────┬─────────┘                     └──────┬───────┘
//!          │ events                               │
//!          ▼                                      ▼
//! ┌──────────────────┐                    ┌───────────────┐
//! │ PresenceTracker  │                    │ BroadcastGroup│
//! │ (roster/cursors) │                    │ (fan-out)     │
//! └──────────────────┘                    └───────────────┘
//!
//! ┌──────────────────┐
//! │ ConflictResolver │  ◄── DocumentChange records from any source
//! │ (pending table)  │      (transport adapter, local editor)
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope and reserved message types
//! - [`transport`] — persistent connection with reconnection, heartbeat
//!   latency, and a bounded outbound queue
//! - [`presence`] — collaborator roster, cursor throttling, periodic
//!   self-announce
//! - [`conflict`] — OT-based conflict detection and resolution
//! - [`broadcast`] — room fan-out used by the relay server
//! - [`server`] — session relay answering liveness probes
//!
//! The conflict resolver is transport-agnostic: it consumes
//! [`conflict::DocumentChange`] records however they arrived. Mapping
//! application edit events onto those records is an adapter concern.

pub mod broadcast;
pub mod conflict;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use conflict::{
    ApplyOutcome, ChangeKind, ConflictInfo, ConflictKind, ConflictResolver, DocumentChange,
    LockState, PositionRange, ResolutionStrategy, ResolverEvent, Severity, StrategyKind,
};
pub use presence::{
    CursorState, DocumentLocation, LocalIdentity, PresenceConfig, PresenceEvent, PresencePatch,
    PresenceStatus, PresenceTracker, SelectionRange, UserPresence,
};
pub use protocol::{MessageKind, ProtocolError, WireMessage};
pub use server::{RelayConfig, RelayServer, ServerStats};
pub use transport::{
    CollabTransport, ConnectionState, MessageQueue, TransportConfig, TransportError,
    TransportEvent, TransportStats,
};
