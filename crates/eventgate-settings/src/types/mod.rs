//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a partial
//! JSON file fills the remaining fields from compiled defaults.

mod api;
mod bus;
mod server;

pub use api::{
    ApiSettings, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_SUBSCRIPTION_LIMIT, SubscriptionLimit,
};
pub use bus::{BusBackend, BusSettings};
pub use server::{LoggingSettings, ServerSettings};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for the gateway process.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Listener and close behaviour.
    pub server: ServerSettings,
    /// Client-facing protocol parameters.
    pub api: ApiSettings,
    /// Pub/sub backend.
    pub bus: BusSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl GatewaySettings {
    /// Reject combinations that cannot serve any client.
    pub fn validate(&self) -> Result<()> {
        if !self.api.websocket_enabled && !self.api.eventstream_enabled {
            return Err(SettingsError::InvalidValue(
                "at least one of websocketEnabled / eventstreamEnabled must be true".into(),
            ));
        }
        if self.api.delivery_buffer == 0 {
            return Err(SettingsError::InvalidValue("deliveryBuffer must be positive".into()));
        }
        if self.bus.backend == BusBackend::Redis && self.bus.redis_url.is_empty() {
            return Err(SettingsError::InvalidValue("redis backend requires redisUrl".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_are_valid() {
        GatewaySettings::default().validate().unwrap();
    }

    #[test]
    fn no_transport_is_invalid() {
        let mut s = GatewaySettings::default();
        s.api.websocket_enabled = false;
        s.api.eventstream_enabled = false;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn redis_without_url_is_invalid() {
        let mut s = GatewaySettings::default();
        s.bus.backend = BusBackend::Redis;
        s.bus.redis_url.clear();
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(GatewaySettings::default()).unwrap();
        assert!(json["server"]["closeGraceMs"].is_u64());
        assert!(json["api"]["heartbeatIntervalMs"].is_u64());
        assert_eq!(json["bus"]["backend"], "memory");
    }
}
