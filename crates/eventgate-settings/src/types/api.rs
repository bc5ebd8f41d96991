//! Client-facing protocol settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Heartbeat interval used when the configured value is `0`.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 45_000;

/// Subscription limit used when the configured value is `0` or below `-1`.
pub const DEFAULT_SUBSCRIPTION_LIMIT: u32 = 500;

/// Resolved per-connection subscription limit.
///
/// The configured `subscriptionLimit` is an `i32` with these meanings:
///
/// | configured | resolved |
/// |------------|----------|
/// | `n > 0`    | `Limited(n)` |
/// | `0`        | `Limited(DEFAULT_SUBSCRIPTION_LIMIT)` |
/// | `-1`       | `Unlimited` |
/// | `< -1`     | `Limited(DEFAULT_SUBSCRIPTION_LIMIT)` |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionLimit {
    /// At most this many active subscriptions.
    Limited(u32),
    /// No limit.
    Unlimited,
}

impl SubscriptionLimit {
    /// Resolve a configured value.
    pub fn from_config(configured: i32) -> Self {
        match configured {
            -1 => Self::Unlimited,
            n if n > 0 => Self::Limited(n as u32),
            _ => Self::Limited(DEFAULT_SUBSCRIPTION_LIMIT),
        }
    }

    /// Whether `active` subscriptions already fill the limit.
    pub fn is_reached(self, active: usize) -> bool {
        match self {
            Self::Limited(max) => active >= max as usize,
            Self::Unlimited => false,
        }
    }

    /// Value advertised in `HELLO`: the limit, or `-1` when unlimited.
    pub fn advertised(self) -> i64 {
        match self {
            Self::Limited(max) => i64::from(max),
            Self::Unlimited => -1,
        }
    }
}

/// Protocol and delivery settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    /// Heartbeat interval in milliseconds; `0` means the default.
    pub heartbeat_interval_ms: u64,
    /// Subscription limit sentinel, see [`SubscriptionLimit`].
    pub subscription_limit: i32,
    /// Accept WebSocket upgrades.
    pub websocket_enabled: bool,
    /// Accept SSE requests.
    pub eventstream_enabled: bool,
    /// Per-connection queue of bus payloads awaiting delivery.
    pub delivery_buffer: usize,
    /// How long a delivered event identity suppresses duplicates.
    pub digest_window_ms: u64,
}

impl ApiSettings {
    /// Effective heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        match self.heartbeat_interval_ms {
            0 => Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            ms => Duration::from_millis(ms),
        }
    }

    /// Effective subscription limit.
    pub fn subscription_limit(&self) -> SubscriptionLimit {
        SubscriptionLimit::from_config(self.subscription_limit)
    }

    /// Digest window as a [`Duration`].
    pub fn digest_window(&self) -> Duration {
        Duration::from_millis(self.digest_window_ms)
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            subscription_limit: 0,
            websocket_enabled: true,
            eventstream_enabled: true,
            delivery_buffer: 256,
            digest_window_ms: 5_000,
        }
    }
}
