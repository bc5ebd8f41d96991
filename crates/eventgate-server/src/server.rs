//! `GatewayServer`: axum router, transport upgrade and graceful shutdown.
//!
//! `GET /v3` and `GET /v3@<subscriptions>` serve both transports: a request
//! carrying WebSocket upgrade headers becomes a duplex connection, anything
//! else becomes a push-only SSE stream whose subscriptions come from the
//! path suffix.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use eventgate_bus::PubSubBridge;
use eventgate_core::CloseCode;
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::connection::Connection;
use crate::connection::eventstream::EventStreamConnection;
use crate::connection::websocket::WebSocketConnection;
use crate::handler::Handler;
use crate::health::{self, HealthResponse};
use crate::query;
use crate::shutdown::ShutdownCoordinator;
use crate::tracker::ConnectionTracker;

/// Path of the gateway endpoint.
pub const GATEWAY_PATH: &str = "/v3";

/// Errors raised while binding or serving.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The accept loop failed.
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
    /// The serving task panicked or was aborted.
    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Resolved configuration.
    pub config: Arc<GatewayConfig>,
    /// Subscription handler shared by every connection.
    pub handler: Arc<Handler>,
    /// Active-connection tracker.
    pub tracker: Arc<ConnectionTracker>,
    /// Shutdown coordinator.
    pub shutdown: ShutdownCoordinator,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus render handle, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Handle to a server started with [`GatewayServer::start`].
pub struct ServerHandle {
    /// Address actually bound.
    pub addr: SocketAddr,
    task: JoinHandle<Result<(), ServerError>>,
}

impl ServerHandle {
    /// Wait for the accept loop to finish.
    pub async fn join(self) -> Result<(), ServerError> {
        self.task.await?
    }
}

/// The gateway server.
pub struct GatewayServer {
    state: AppState,
}

impl GatewayServer {
    /// Create a server over `bridge`.
    pub fn new(config: GatewayConfig, bridge: PubSubBridge, metrics: Option<PrometheusHandle>) -> Self {
        let shutdown = ShutdownCoordinator::new();
        let tracker = Arc::new(ConnectionTracker::new(shutdown.clone(), config.close_grace));
        let handler = Arc::new(Handler::new(bridge, config.subscription_limit));
        Self {
            state: AppState {
                config: Arc::new(config),
                handler,
                tracker,
                shutdown,
                start_time: Instant::now(),
                metrics,
            },
        }
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route(GATEWAY_PATH, get(gateway_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/{target}", get(gateway_target_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Resolved configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.state.config
    }

    /// Shutdown coordinator.
    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.state.shutdown
    }

    /// Connection tracker.
    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.state.tracker
    }

    /// Shared bridge.
    pub fn bridge(&self) -> &PubSubBridge {
        self.state.handler.bridge()
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Serve on `listener` until shutdown is requested.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let token = self.state.shutdown.token();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(token.cancelled_owned())
            .await?;
        Ok(())
    }

    /// Bind and serve until shutdown is requested.
    pub async fn listen(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        info!(addr = %listener.local_addr()?, "gateway listening");
        self.serve(listener).await
    }

    /// Bind and serve in a background task.
    pub async fn start(&self) -> Result<ServerHandle, ServerError> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        info!(%addr, "gateway listening");

        let token = self.state.shutdown.token();
        let router = self.router();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await?;
            Ok(())
        });
        Ok(ServerHandle { addr, task })
    }

    /// Start shutdown and wait for tracked connections to close.
    ///
    /// Returns `false` if connections were still open after the configured
    /// shutdown timeout.
    pub async fn shutdown(&self) -> bool {
        self.state.shutdown.shutdown();
        let timeout = self.state.config.shutdown_timeout;
        let drained = self.state.tracker.wait_idle(timeout).await;
        if drained {
            info!("all connections closed");
        } else {
            warn!(
                remaining = self.state.tracker.active_connections(),
                timeout_ms = timeout.as_millis() as u64,
                "shutdown timed out with open connections"
            );
        }
        drained
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_shutting_down(),
        state.tracker.active_connections(),
        state.handler.bridge().channel_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /v3
async fn gateway_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    open_connection(state, &headers, ws, "")
}

/// GET /v3@<subscriptions>
async fn gateway_target_handler(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // The raw path keeps the suffix percent-encoded for the query parser.
    let Some(suffix) = uri.path().strip_prefix(GATEWAY_PATH) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !(suffix.starts_with('@') || suffix.starts_with("%40")) {
        return StatusCode::NOT_FOUND.into_response();
    }
    open_connection(state, &headers, ws, suffix)
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn open_connection(
    state: AppState,
    headers: &HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    suffix: &str,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, CloseCode::Restart.reason()).into_response();
    }
    if is_upgrade_request(headers) {
        if !state.config.websocket_enabled {
            return (StatusCode::SERVICE_UNAVAILABLE, "websocket transport disabled").into_response();
        }
        match ws {
            Ok(ws) => upgrade_websocket(state, ws),
            Err(rejection) => rejection.into_response(),
        }
    } else {
        if !state.config.eventstream_enabled {
            return (StatusCode::SERVICE_UNAVAILABLE, "eventstream transport disabled").into_response();
        }
        open_event_stream(state, suffix)
    }
}

fn upgrade_websocket(state: AppState, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            match WebSocketConnection::start(socket, Arc::clone(&state.handler), &state.config).await {
                Ok(conn) => {
                    let _ = state.tracker.track(conn).await;
                }
                Err(error) => warn!(%error, "websocket connection setup failed"),
            }
        })
}

fn open_event_stream(state: AppState, suffix: &str) -> Response {
    let subscriptions = query::parse_subscriptions(suffix);
    let (conn, body) = match EventStreamConnection::open(Arc::clone(&state.handler), &state.config) {
        Ok(opened) => opened,
        Err(error) => {
            warn!(%error, "event stream setup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let _ = tokio::spawn(async move {
        let tracking = {
            let tracker = Arc::clone(&state.tracker);
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { tracker.track(conn).await })
        };
        if let Err(error) = conn.start(subscriptions).await {
            warn!(%error, "event stream connection setup failed");
            conn.core().close(CloseCode::ServerError, Duration::ZERO).await;
        }
        let _ = tracking.await;
    });

    Sse::new(body).into_response()
}
