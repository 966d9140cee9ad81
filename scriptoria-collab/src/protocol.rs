//! JSON wire envelope for the collaboration channel.
//!
//! Every frame on the wire is one envelope:
//! ```text
//! { "type": "...", "payload": {...}, "timestamp": epoch-millis,
//!   "userId": "...", "sessionId": "..." }
//! ```
//!
//! The `type` field is an open set — document-edit messages defined by
//! adapters pass through untouched. The kinds the engine itself consumes
//! or produces are enumerated in [`MessageKind`].

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Message types consumed or produced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Liveness probe, sent on a timer while connected.
    Heartbeat,
    /// Echo of a heartbeat, carrying the original timestamp.
    HeartbeatResponse,
    /// Join announcement with the full local presence record.
    UserPresence,
    /// Full presence record, sent on meaningful state transitions.
    PresenceUpdate,
    /// High-frequency cursor position, throttled by the sender.
    CursorUpdate,
    /// Explicit membership notification from the channel.
    UserJoined,
    /// Explicit membership notification from the channel.
    UserLeft,
    /// Best-effort goodbye on teardown.
    UserLeaving,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::HeartbeatResponse => "heartbeat_response",
            MessageKind::UserPresence => "user_presence",
            MessageKind::PresenceUpdate => "presence_update",
            MessageKind::CursorUpdate => "cursor_update",
            MessageKind::UserJoined => "user_joined",
            MessageKind::UserLeft => "user_left",
            MessageKind::UserLeaving => "user_leaving",
        }
    }

    /// Parse a reserved type tag. Returns `None` for adapter-defined types.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "heartbeat" => Some(MessageKind::Heartbeat),
            "heartbeat_response" => Some(MessageKind::HeartbeatResponse),
            "user_presence" => Some(MessageKind::UserPresence),
            "presence_update" => Some(MessageKind::PresenceUpdate),
            "cursor_update" => Some(MessageKind::CursorUpdate),
            "user_joined" => Some(MessageKind::UserJoined),
            "user_left" => Some(MessageKind::UserLeft),
            "user_leaving" => Some(MessageKind::UserLeaving),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level wire envelope.
///
/// Transient: constructed per send/receive, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Epoch millis at construction time.
    pub timestamp: u64,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
    #[serde(
        rename = "sessionId",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub session_id: Option<String>,
}

/// Payload of `heartbeat` and `heartbeat_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: u64,
}

/// Payload of `user_left` and `user_leaving`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeavePayload {
    #[serde(rename = "userId")]
    pub user_id: String,
}

impl WireMessage {
    /// Build an envelope for an arbitrary message type.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: now_millis(),
            user_id: None,
            session_id: None,
        }
    }

    pub fn with_sender(
        mut self,
        user_id: Option<String>,
        session_id: Option<String>,
    ) -> Self {
        self.user_id = user_id;
        self.session_id = session_id;
        self
    }

    /// Create a heartbeat stamped with the send time.
    pub fn heartbeat() -> Self {
        let now = now_millis();
        Self::new(
            MessageKind::Heartbeat.as_str(),
            serde_json::json!({ "timestamp": now }),
        )
    }

    /// Create a heartbeat response echoing the probe's timestamp.
    pub fn heartbeat_response(echo: u64) -> Self {
        Self::new(
            MessageKind::HeartbeatResponse.as_str(),
            serde_json::json!({ "timestamp": echo }),
        )
    }

    /// Create a `user_leaving` goodbye.
    pub fn user_leaving(user_id: &str) -> Self {
        Self::new(
            MessageKind::UserLeaving.as_str(),
            serde_json::json!({ "userId": user_id }),
        )
    }

    /// The reserved kind, if this is an engine message.
    pub fn reserved(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.kind)
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from the JSON wire format.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Parse a heartbeat or heartbeat-response payload.
    pub fn heartbeat_payload(&self) -> Result<HeartbeatPayload, ProtocolError> {
        match self.reserved() {
            Some(MessageKind::Heartbeat) | Some(MessageKind::HeartbeatResponse) => {
                serde_json::from_value(self.payload.clone())
                    .map_err(|e| ProtocolError::Decode(e.to_string()))
            }
            _ => Err(ProtocolError::UnexpectedType(self.kind.clone())),
        }
    }

    /// Parse a leave payload (`user_left` / `user_leaving`).
    pub fn leave_payload(&self) -> Result<LeavePayload, ProtocolError> {
        match self.reserved() {
            Some(MessageKind::UserLeft) | Some(MessageKind::UserLeaving) => {
                serde_json::from_value(self.payload.clone())
                    .map_err(|e| ProtocolError::Decode(e.to_string()))
            }
            _ => Err(ProtocolError::UnexpectedType(self.kind.clone())),
        }
    }
}

/// Wire-level errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("unexpected message type `{0}`")]
    UnexpectedType(String),
}

/// Current wall-clock time as epoch millis.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
