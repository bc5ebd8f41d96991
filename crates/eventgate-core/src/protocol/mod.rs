//! Wire protocol.
//!
//! Every frame is a JSON envelope `{"op": <u8>, "t": <unix ms>, "d": <payload>}`.
//! [`Message`] is the typed view of that envelope: one variant per opcode,
//! each with its own payload shape. Conversion in both directions goes
//! through an explicit match on the opcode.

mod opcode;
mod payloads;

pub use opcode::{CloseCode, Opcode};
pub use payloads::{
    AckPayload, DispatchPayload, EndOfStreamPayload, ErrorPayload, HeartbeatPayload, HelloPayload,
    ReconnectPayload, ResumePayload, SubscribePayload,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;

/// Untyped wire envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Opcode.
    pub op: u8,
    /// Send time in unix milliseconds.
    #[serde(default)]
    pub t: i64,
    /// Opcode-specific payload.
    #[serde(default)]
    pub d: Value,
}

/// Typed protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// See [`Opcode::Dispatch`].
    Dispatch(DispatchPayload),
    /// See [`Opcode::Hello`].
    Hello(HelloPayload),
    /// See [`Opcode::Heartbeat`].
    Heartbeat(HeartbeatPayload),
    /// See [`Opcode::Reconnect`].
    Reconnect(ReconnectPayload),
    /// See [`Opcode::Ack`].
    Ack(AckPayload),
    /// See [`Opcode::Error`].
    Error(ErrorPayload),
    /// See [`Opcode::EndOfStream`].
    EndOfStream(EndOfStreamPayload),
    /// See [`Opcode::Identify`]. Carried opaquely; authentication is external.
    Identify(Value),
    /// See [`Opcode::Resume`].
    Resume(ResumePayload),
    /// See [`Opcode::Subscribe`].
    Subscribe(SubscribePayload),
    /// See [`Opcode::Unsubscribe`].
    Unsubscribe(SubscribePayload),
    /// See [`Opcode::Signal`].
    Signal(Value),
}

impl Message {
    /// Opcode of this message.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Dispatch(_) => Opcode::Dispatch,
            Self::Hello(_) => Opcode::Hello,
            Self::Heartbeat(_) => Opcode::Heartbeat,
            Self::Reconnect(_) => Opcode::Reconnect,
            Self::Ack(_) => Opcode::Ack,
            Self::Error(_) => Opcode::Error,
            Self::EndOfStream(_) => Opcode::EndOfStream,
            Self::Identify(_) => Opcode::Identify,
            Self::Resume(_) => Opcode::Resume,
            Self::Subscribe(_) => Opcode::Subscribe,
            Self::Unsubscribe(_) => Opcode::Unsubscribe,
            Self::Signal(_) => Opcode::Signal,
        }
    }

    /// Payload as a JSON value.
    pub fn payload(&self) -> Result<Value, ProtocolError> {
        let value = match self {
            Self::Dispatch(p) => serde_json::to_value(p)?,
            Self::Hello(p) => serde_json::to_value(p)?,
            Self::Heartbeat(p) => serde_json::to_value(p)?,
            Self::Reconnect(p) => serde_json::to_value(p)?,
            Self::Ack(p) => serde_json::to_value(p)?,
            Self::Error(p) => serde_json::to_value(p)?,
            Self::EndOfStream(p) => serde_json::to_value(p)?,
            Self::Resume(p) => serde_json::to_value(p)?,
            Self::Subscribe(p) | Self::Unsubscribe(p) => serde_json::to_value(p)?,
            Self::Identify(v) | Self::Signal(v) => v.clone(),
        };
        Ok(value)
    }

    /// Build the envelope, stamped with the current time.
    pub fn to_raw(&self) -> Result<RawMessage, ProtocolError> {
        Ok(RawMessage {
            op: self.opcode().code(),
            t: chrono::Utc::now().timestamp_millis(),
            d: self.payload()?,
        })
    }

    /// Decode a typed message from an envelope.
    pub fn from_raw(raw: RawMessage) -> Result<Self, ProtocolError> {
        let op = Opcode::try_from(raw.op)?;
        let d = raw.d;
        Ok(match op {
            Opcode::Dispatch => Self::Dispatch(serde_json::from_value(d)?),
            Opcode::Hello => Self::Hello(serde_json::from_value(d)?),
            Opcode::Heartbeat => Self::Heartbeat(serde_json::from_value(d)?),
            Opcode::Reconnect => Self::Reconnect(serde_json::from_value(d)?),
            Opcode::Ack => Self::Ack(serde_json::from_value(d)?),
            Opcode::Error => Self::Error(serde_json::from_value(d)?),
            Opcode::EndOfStream => Self::EndOfStream(serde_json::from_value(d)?),
            Opcode::Identify => Self::Identify(d),
            Opcode::Resume => Self::Resume(serde_json::from_value(d)?),
            Opcode::Subscribe => Self::Subscribe(serde_json::from_value(d)?),
            Opcode::Unsubscribe => Self::Unsubscribe(serde_json::from_value(d)?),
            Opcode::Signal => Self::Signal(d),
        })
    }

    /// Serialize the full envelope to a JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&self.to_raw()?)?)
    }

    /// Parse a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawMessage = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    /// Parse a frame sent by a client, rejecting server-only opcodes.
    pub fn from_client_json(text: &str) -> Result<Self, ProtocolError> {
        let msg = Self::from_json(text)?;
        if !msg.opcode().is_client_op() {
            return Err(ProtocolError::UnexpectedOpcode(msg.opcode().name().to_string()));
        }
        Ok(msg)
    }

    /// SSE event name and data for the push-only transport.
    ///
    /// The event name is the lower-case opcode name and the data is the
    /// payload JSON without the envelope.
    pub fn to_sse(&self) -> Result<(String, String), ProtocolError> {
        let data = serde_json::to_string(&self.payload()?)?;
        Ok((self.opcode().name().to_lowercase(), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn hello_envelope_shape() {
        let msg = Message::Hello(HelloPayload {
            heartbeat_interval: 45_000,
            session_id: crate::SessionId::generate().unwrap(),
            subscription_limit: 500,
        });
        let raw = msg.to_raw().unwrap();
        assert_eq!(raw.op, 1);
        assert!(raw.t > 0);
        assert_eq!(raw.d["heartbeat_interval"], 45_000);
        assert_eq!(raw.d["subscription_limit"], 500);
        assert_eq!(raw.d["session_id"].as_str().unwrap().len(), 32);
    }

    #[test]
    fn decode_subscribe_frame() {
        let text = r#"{"op":35,"d":{"type":"chat.message","condition":{"room":"1"}}}"#;
        let msg = Message::from_client_json(text).unwrap();
        assert_matches!(msg, Message::Subscribe(p) => {
            assert_eq!(p.event_type, "chat.message");
            assert_eq!(p.condition.get("room").map(String::as_str), Some("1"));
        });
    }

    #[test]
    fn subscribe_condition_defaults_to_empty() {
        let msg = Message::from_json(r#"{"op":36,"d":{"type":"chat.*"}}"#).unwrap();
        assert_matches!(msg, Message::Unsubscribe(p) if p.condition.is_empty());
    }

    #[test]
    fn end_of_stream_decodes_close_code() {
        let text = r#"{"op":7,"t":1,"d":{"code":4006,"message":"Server is restarting"}}"#;
        let msg = Message::from_json(text).unwrap();
        assert_matches!(msg, Message::EndOfStream(p) if p.code == CloseCode::Restart);
    }

    #[test]
    fn payload_mismatch_is_malformed() {
        let err = Message::from_json(r#"{"op":35,"d":{"condition":{}}}"#).unwrap_err();
        assert_matches!(err, ProtocolError::Malformed(_));
    }

    #[test]
    fn not_json_is_malformed() {
        assert_matches!(Message::from_json("hello"), Err(ProtocolError::Malformed(_)));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_matches!(
            Message::from_json(r#"{"op":99,"d":{}}"#),
            Err(ProtocolError::UnknownOpcode(99))
        );
    }

    #[test]
    fn client_cannot_send_server_opcodes() {
        let text = r#"{"op":2,"d":{"count":1}}"#;
        assert!(Message::from_json(text).is_ok());
        assert_matches!(
            Message::from_client_json(text),
            Err(ProtocolError::UnexpectedOpcode(name)) if name == "HEARTBEAT"
        );
    }

    #[test]
    fn opaque_payloads_pass_through() {
        let msg = Message::from_json(r#"{"op":37,"d":{"anything":[1,2]}}"#).unwrap();
        assert_eq!(msg, Message::Signal(json!({"anything": [1, 2]})));
    }

    #[test]
    fn sse_rendering() {
        let msg = Message::Heartbeat(HeartbeatPayload { count: 3 });
        let (event, data) = msg.to_sse().unwrap();
        assert_eq!(event, "heartbeat");
        assert_eq!(data, r#"{"count":3}"#);
    }

    #[test]
    fn error_payload_json() {
        let mut fields = std::collections::BTreeMap::new();
        let _ = fields.insert("limit".to_string(), json!(2));
        let msg = Message::Error(ErrorPayload {
            message: "Too Many Active Subscriptions!".into(),
            fields,
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["op"], 6);
        assert_eq!(value["d"]["fields"]["limit"], 2);
    }
}
