//! Active-connection accounting and shutdown fan-out.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use eventgate_core::CloseCode;
use metrics::{counter, gauge, histogram};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::metrics::{CONNECTION_DURATION_SECONDS, CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL};
use crate::shutdown::ShutdownCoordinator;

/// Counts ready connections and closes them with `Restart` on shutdown.
pub struct ConnectionTracker {
    active: AtomicUsize,
    shutdown: ShutdownCoordinator,
    close_grace: Duration,
    idle: Notify,
}

impl ConnectionTracker {
    /// Create a tracker observing `shutdown`. Connections closed by shutdown
    /// get `close_grace` to acknowledge.
    pub fn new(shutdown: ShutdownCoordinator, close_grace: Duration) -> Self {
        Self {
            active: AtomicUsize::new(0),
            shutdown,
            close_grace,
            idle: Notify::new(),
        }
    }

    /// Number of connections between ready and closed.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Track `conn` until it closes.
    ///
    /// Returns `false` without counting anything if the connection closed
    /// before becoming ready.
    pub async fn track(&self, conn: Arc<dyn Connection>) -> bool {
        let ready = conn.on_ready();
        let closed = conn.on_close();
        tokio::select! {
            biased;
            () = ready.cancelled() => {}
            () = closed.cancelled() => {
                debug!(session_id = %conn.session_id(), "connection closed before ready");
                return false;
            }
        }

        let transport = conn.kind().as_str();
        let _ = self.active.fetch_add(1, Ordering::AcqRel);
        gauge!(CONNECTIONS_ACTIVE, "transport" => transport).increment(1.0);
        counter!(CONNECTIONS_TOTAL, "transport" => transport).increment(1);
        let started = Instant::now();

        let watcher = {
            let conn = Arc::clone(&conn);
            let shutdown = self.shutdown.token();
            let ctx = conn.context();
            let grace = self.close_grace;
            tokio::spawn(async move {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        conn.close(CloseCode::Restart, grace).await;
                    }
                    () = ctx.cancelled() => {}
                }
            })
        };

        closed.cancelled().await;
        if let Err(error) = watcher.await {
            warn!(session_id = %conn.session_id(), %error, "connection watcher failed");
        }

        gauge!(CONNECTIONS_ACTIVE, "transport" => transport).decrement(1.0);
        histogram!(CONNECTION_DURATION_SECONDS, "transport" => transport)
            .record(started.elapsed().as_secs_f64());
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
        true
    }

    /// Wait until no connection is active. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.idle.notified();
                if self.active_connections() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}
