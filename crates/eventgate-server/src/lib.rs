//! # eventgate-server
//!
//! Connection engine and HTTP surface of the gateway.
//!
//! - **Connections**: [`connection::Connection`] over a shared
//!   [`connection::ConnectionCore`], with WebSocket (duplex) and SSE
//!   (push-only) variants
//! - **Subscriptions**: [`handler::Handler`] applies commands to the
//!   per-connection [`event_map::EventMap`]; [`digest::EventDigest`]
//!   suppresses duplicate dispatches
//! - **Lifecycle**: [`tracker::ConnectionTracker`] counts connections and
//!   closes them on [`shutdown::ShutdownCoordinator`] broadcast
//! - **HTTP**: [`server::GatewayServer`] serves `/v3`, `/health` and `/metrics`

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod digest;
pub mod event_map;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod query;
pub mod server;
pub mod shutdown;
pub mod tracker;

pub use config::GatewayConfig;
pub use connection::{Connection, ConnectionCore, ConnectionKind};
pub use handler::Handler;
pub use server::{GatewayServer, ServerError, ServerHandle};
pub use shutdown::ShutdownCoordinator;
pub use tracker::ConnectionTracker;
