//! # eventgate
//!
//! Gateway binary: loads settings, installs logging and metrics, picks the
//! pub/sub backend and serves `/v3` until Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use eventgate_bus::{MemoryBus, MessageBus, PubSubBridge};
use eventgate_core::logging::{LogFormat, init_subscriber};
use eventgate_server::{GatewayConfig, GatewayServer};
use eventgate_settings::{BusBackend, GatewaySettings};

/// Real-time event gateway.
#[derive(Parser, Debug)]
#[command(name = "eventgate", about = "Real-time event gateway")]
struct Cli {
    /// Settings file (defaults to `~/.eventgate/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log level or `RUST_LOG`-style filter (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn load_settings(&self) -> Result<GatewaySettings> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(eventgate_settings::settings_path);
        let mut settings = eventgate_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        self.apply(&mut settings);
        settings
            .validate()
            .context("Invalid settings after command-line overrides")?;
        Ok(settings)
    }

    fn apply(&self, settings: &mut GatewaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
    }
}

async fn connect_bus(settings: &GatewaySettings) -> Result<Arc<dyn MessageBus>> {
    match settings.bus.backend {
        BusBackend::Memory => Ok(Arc::new(MemoryBus::new())),
        #[cfg(feature = "redis")]
        BusBackend::Redis => {
            let bus = eventgate_bus::RedisBus::connect(&settings.bus.redis_url)
                .await
                .context("Failed to connect to redis")?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(feature = "redis"))]
        BusBackend::Redis => anyhow::bail!("redis bus requested but eventgate was built without the `redis` feature"),
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;

    init_subscriber(
        &settings.logging.level,
        LogFormat::from_json_flag(settings.logging.json),
    );
    tracing::info!("Starting eventgate");

    let metrics = eventgate_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let bus = connect_bus(&settings).await?;
    let bridge = PubSubBridge::new(bus);
    let server = GatewayServer::new(GatewayConfig::from(&settings), bridge.clone(), Some(metrics));

    let handle = server.start().await.context("Failed to bind server")?;
    tracing::info!(
        backend = ?settings.bus.backend,
        "eventgate listening on http://{}",
        handle.addr
    );

    wait_for_signal().await?;

    tracing::info!("Shutting down...");
    let _ = server.shutdown().await;
    bridge.close();
    handle.join().await.context("Server task failed")?;

    tracing::info!("Shutdown complete");
    Ok(())
}
