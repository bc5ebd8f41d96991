//! Opcode-specific payload shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::Condition;
use crate::ids::SessionId;
use crate::protocol::CloseCode;

/// `DISPATCH`: an event delivered to the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchPayload {
    /// Concrete event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event body as published.
    pub body: Value,
}

/// `HELLO`: session parameters sent right after the transport opens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
    /// Session id assigned to this connection.
    pub session_id: SessionId,
    /// Maximum subscriptions, `-1` when unlimited.
    pub subscription_limit: i64,
}

/// `HEARTBEAT`: keepalive with a count starting at 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Number of heartbeats sent so far on this session.
    pub count: u64,
}

/// `RECONNECT`: ask the client to reconnect.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPayload {
    /// Why the client should reconnect.
    #[serde(default)]
    pub reason: String,
}

/// `ACK`: a command was accepted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Name of the acknowledged command (e.g. `SUBSCRIBE`).
    pub command: String,
    /// Command-specific data.
    pub data: Value,
}

/// `ERROR`: a command was rejected.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable reason.
    pub message: String,
    /// Structured context.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

/// `END_OF_STREAM`: the session is ending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndOfStreamPayload {
    /// Close code.
    pub code: CloseCode,
    /// Human-readable reason.
    pub message: String,
}

impl From<CloseCode> for EndOfStreamPayload {
    fn from(code: CloseCode) -> Self {
        Self {
            code,
            message: code.reason().to_string(),
        }
    }
}

/// `RESUME`: the client asks to resume an earlier session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePayload {
    /// Session to resume.
    pub session_id: String,
}

/// `SUBSCRIBE` / `UNSUBSCRIBE`: an event type plus optional condition.
///
/// The type is kept as a raw string so an invalid type can be rejected with
/// an `ERROR` frame instead of failing the whole frame decode.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePayload {
    /// Event type, possibly wildcarded.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Attribute constraints; empty matches every event of the type.
    #[serde(default)]
    pub condition: Condition,
}

impl SubscribePayload {
    /// Payload for a type with no condition.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            condition: Condition::new(),
        }
    }

    /// Add a condition entry.
    #[must_use]
    pub fn with_condition(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.condition.insert(key.into(), value.into());
        self
    }
}
