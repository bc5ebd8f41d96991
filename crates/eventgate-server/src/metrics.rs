//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render `/metrics`. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Active connections (gauge, labels: transport).
pub const CONNECTIONS_ACTIVE: &str = "eventgate_connections_active";
/// Connections that reached ready (counter, labels: transport).
pub const CONNECTIONS_TOTAL: &str = "eventgate_connections_total";
/// Ready-to-closed duration in seconds (histogram, labels: transport).
pub const CONNECTION_DURATION_SECONDS: &str = "eventgate_connection_duration_seconds";
/// Dispatch frames written (counter).
pub const DISPATCH_TOTAL: &str = "eventgate_dispatch_total";
/// Dispatches suppressed by the digest (counter).
pub const DISPATCH_DEDUPLICATED_TOTAL: &str = "eventgate_dispatch_deduplicated_total";
pub use eventgate_bus::BRIDGE_DROPS_TOTAL;
