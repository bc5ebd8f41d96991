//! Runtime configuration for the connection engine.
//!
//! [`GatewayConfig`] is the resolved, typed view of the settings file that
//! the server and every connection read from. Sentinels (`0` heartbeat,
//! subscription-limit values) are already resolved here.

use std::time::Duration;

use eventgate_settings::{GatewaySettings, SubscriptionLimit};

/// Resolved configuration shared by the server and its connections.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval between `HEARTBEAT` frames.
    pub heartbeat_interval: Duration,
    /// Per-connection subscription limit.
    pub subscription_limit: SubscriptionLimit,
    /// Accept WebSocket upgrades.
    pub websocket_enabled: bool,
    /// Accept SSE requests.
    pub eventstream_enabled: bool,
    /// Per-connection bus payload queue depth.
    pub delivery_buffer: usize,
    /// Duplicate-suppression window.
    pub digest_window: Duration,
    /// Grace period used when closing a connection.
    pub close_grace: Duration,
    /// How long shutdown waits for connections to drain.
    pub shutdown_timeout: Duration,
}

impl From<&GatewaySettings> for GatewayConfig {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_size,
            heartbeat_interval: settings.api.heartbeat_interval(),
            subscription_limit: settings.api.subscription_limit(),
            websocket_enabled: settings.api.websocket_enabled,
            eventstream_enabled: settings.api.eventstream_enabled,
            delivery_buffer: settings.api.delivery_buffer.max(1),
            digest_window: settings.api.digest_window(),
            close_grace: settings.server.close_grace(),
            shutdown_timeout: settings.server.shutdown_timeout(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&GatewaySettings::default())
    }
}
