//! Bus error types.

use thiserror::Error;

/// Errors raised by a [`MessageBus`](crate::MessageBus) or the bridge.
#[derive(Debug, Error)]
pub enum BusError {
    /// The backend refused or failed the operation.
    #[error("bus backend error: {0}")]
    Backend(String),
    /// The payload could not be encoded.
    #[error("failed to encode bus payload: {0}")]
    Encode(#[from] serde_json::Error),
    /// The bridge or bus was shut down.
    #[error("bus is closed")]
    Closed,
}

impl BusError {
    /// An owned copy for reporting one failure to several waiters.
    pub fn replicate(&self) -> Self {
        match self {
            Self::Backend(reason) => Self::Backend(reason.clone()),
            Self::Encode(err) => Self::Backend(err.to_string()),
            Self::Closed => Self::Closed,
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<BusError> for eventgate_core::GatewayError {
    fn from(err: BusError) -> Self {
        Self::Bus(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use eventgate_core::GatewayError;

    #[test]
    fn converts_into_gateway_error() {
        let err: GatewayError = BusError::Closed.into();
        assert_matches!(err, GatewayError::Bus(msg) if msg == "bus is closed");
    }

    #[test]
    fn backend_display() {
        let err = BusError::Backend("connection refused".into());
        assert_eq!(err.to_string(), "bus backend error: connection refused");
    }
}
