//! Error hierarchy for the gateway.
//!
//! [`GatewayError`] follows the four failure classes a connection can hit:
//!
//! - **Protocol**: malformed client frames and rejected commands. Reported to
//!   the client as an `Error` frame; the connection stays open.
//! - **Transport**: write failures and unexpected disconnects. Logged, and the
//!   connection moves straight to closing.
//! - **Setup**: session id generation or handshake failures. The connection
//!   is rejected before it is ever tracked.
//! - **Bus**: publish/subscribe failures on the external pub/sub substrate.

use thiserror::Error;

/// Errors raised while decoding or validating wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON or did not match the envelope shape.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The opcode is not part of the protocol.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    /// The opcode is known but a client may not send it.
    #[error("opcode {0} is not accepted from clients")]
    UnexpectedOpcode(String),
    /// An event type failed validation.
    #[error("invalid event type '{0}'")]
    InvalidEventType(String),
}

/// Top-level gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Client sent something the protocol does not allow.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The underlying socket or stream failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection could not be set up (before it was tracked).
    #[error("connection setup failed: {0}")]
    Setup(String),

    /// The pub/sub bus rejected an operation.
    #[error("bus error: {0}")]
    Bus(String),
}

impl GatewayError {
    /// Build a transport error from anything displayable.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Build a setup error from anything displayable.
    pub fn setup(err: impl std::fmt::Display) -> Self {
        Self::Setup(err.to_string())
    }

    /// Whether this error should end the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Setup(_))
    }
}

/// Result alias used across the gateway crates.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn protocol_error_converts() {
        let json_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: GatewayError = ProtocolError::from(json_err).into();
        assert_matches!(err, GatewayError::Protocol(ProtocolError::Malformed(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn transport_errors_are_fatal() {
        let err = GatewayError::transport("broken pipe");
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "transport error: broken pipe");
    }

    #[test]
    fn setup_error_display() {
        let err = GatewayError::setup("rng unavailable");
        assert_eq!(err.to_string(), "connection setup failed: rng unavailable");
    }

    #[test]
    fn unknown_opcode_display() {
        let err = ProtocolError::UnknownOpcode(99);
        assert_eq!(err.to_string(), "unknown opcode 99");
    }
}
