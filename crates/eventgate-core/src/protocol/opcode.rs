//! Operation codes and close codes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Operation code carried in every wire envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Server → client: an event matching one of the client's subscriptions.
    Dispatch = 0,
    /// Server → client: first frame of every session.
    Hello = 1,
    /// Server → client: keepalive carrying a running count.
    Heartbeat = 2,
    /// Server → client: the client should reconnect.
    Reconnect = 4,
    /// Server → client: a command was accepted.
    Ack = 5,
    /// Server → client: a command was rejected.
    Error = 6,
    /// Server → client: the server is closing the session.
    EndOfStream = 7,
    /// Client → server: identify with credentials.
    Identify = 33,
    /// Client → server: resume a previous session.
    Resume = 34,
    /// Client → server: subscribe to an event type.
    Subscribe = 35,
    /// Client → server: remove a subscription.
    Unsubscribe = 36,
    /// Client → server: free-form signal.
    Signal = 37,
}

impl Opcode {
    /// Numeric wire value.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Upper-case name, also used as the SSE event name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "DISPATCH",
            Self::Hello => "HELLO",
            Self::Heartbeat => "HEARTBEAT",
            Self::Reconnect => "RECONNECT",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
            Self::EndOfStream => "END_OF_STREAM",
            Self::Identify => "IDENTIFY",
            Self::Resume => "RESUME",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Signal => "SIGNAL",
        }
    }

    /// Whether clients are allowed to send this opcode.
    pub fn is_client_op(self) -> bool {
        self.code() >= 33
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => Opcode::Dispatch,
            1 => Opcode::Hello,
            2 => Opcode::Heartbeat,
            4 => Opcode::Reconnect,
            5 => Opcode::Ack,
            6 => Opcode::Error,
            7 => Opcode::EndOfStream,
            33 => Opcode::Identify,
            34 => Opcode::Resume,
            35 => Opcode::Subscribe,
            36 => Opcode::Unsubscribe,
            37 => Opcode::Signal,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reason a session was ended, sent in `EndOfStream` and the transport close frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum CloseCode {
    /// Ordinary closure.
    Normal,
    /// Unexpected server-side failure.
    ServerError,
    /// Client sent an opcode the server does not handle.
    UnknownOperation,
    /// Client sent a payload that could not be decoded.
    InvalidPayload,
    /// Authentication failed.
    AuthFailure,
    /// Client identified twice.
    AlreadyIdentified,
    /// Client exceeded a rate limit.
    RateLimit,
    /// The server is restarting; reconnect.
    Restart,
    /// The server is in maintenance.
    Maintenance,
    /// The client stopped responding.
    Timeout,
    /// Subscription already exists.
    AlreadySubscribed,
    /// Subscription does not exist.
    NotSubscribed,
    /// Client lacks permission.
    InsufficientPrivilege,
}

impl CloseCode {
    /// Numeric code (1000 or 4000-4011).
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::ServerError => 4000,
            Self::UnknownOperation => 4001,
            Self::InvalidPayload => 4002,
            Self::AuthFailure => 4003,
            Self::AlreadyIdentified => 4004,
            Self::RateLimit => 4005,
            Self::Restart => 4006,
            Self::Maintenance => 4007,
            Self::Timeout => 4008,
            Self::AlreadySubscribed => 4009,
            Self::NotSubscribed => 4010,
            Self::InsufficientPrivilege => 4011,
        }
    }

    /// Human-readable reason.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Normal => "Normal closure",
            Self::ServerError => "Internal server error",
            Self::UnknownOperation => "Unknown operation",
            Self::InvalidPayload => "Invalid payload",
            Self::AuthFailure => "Authentication failed",
            Self::AlreadyIdentified => "Already identified",
            Self::RateLimit => "Rate limit reached",
            Self::Restart => "Server is restarting",
            Self::Maintenance => "Maintenance mode",
            Self::Timeout => "Timeout",
            Self::AlreadySubscribed => "Already subscribed",
            Self::NotSubscribed => "Not subscribed",
            Self::InsufficientPrivilege => "Insufficient privilege",
        }
    }

    /// Whether the closure indicates a failure. Shutdown closes are not errors.
    pub fn is_error(self) -> bool {
        !matches!(self, Self::Normal | Self::Restart | Self::Maintenance)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.code()
    }
}

impl TryFrom<u16> for CloseCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, String> {
        Ok(match value {
            1000 => Self::Normal,
            4000 => Self::ServerError,
            4001 => Self::UnknownOperation,
            4002 => Self::InvalidPayload,
            4003 => Self::AuthFailure,
            4004 => Self::AlreadyIdentified,
            4005 => Self::RateLimit,
            4006 => Self::Restart,
            4007 => Self::Maintenance,
            4008 => Self::Timeout,
            4009 => Self::AlreadySubscribed,
            4010 => Self::NotSubscribed,
            4011 => Self::InsufficientPrivilege,
            other => return Err(format!("unknown close code {other}")),
        })
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason(), self.code())
    }
}
