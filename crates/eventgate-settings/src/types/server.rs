//! Listener and logging settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// HTTP listener and connection teardown settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port. `0` picks an ephemeral port.
    pub port: u16,
    /// Largest accepted inbound WebSocket frame, in bytes.
    pub max_message_size: usize,
    /// How long shutdown waits for tracked connections to drain.
    pub shutdown_timeout_ms: u64,
    /// Grace period a closing connection waits for the peer.
    pub close_grace_ms: u64,
}

impl ServerSettings {
    /// `shutdown_timeout_ms` as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// `close_grace_ms` as a [`Duration`].
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3700,
            max_message_size: 64 * 1024,
            shutdown_timeout_ms: 30_000,
            close_grace_ms: 5_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
