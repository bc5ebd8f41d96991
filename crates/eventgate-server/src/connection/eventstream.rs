//! Push-only variant over a server-sent events response.
//!
//! The client cannot send frames, so subscriptions come from the request
//! URI and are applied before the connection reports ready. Each protocol
//! message becomes one SSE event named after its opcode. The response body
//! holds a drop guard on the drain signal, so a client that goes away closes
//! the connection.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::response::sse::Event;
use eventgate_core::protocol::SubscribePayload;
use eventgate_core::{CloseCode, GatewayError, Message, Result};
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Connection, ConnectionCore, ConnectionKind, FrameWriter};
use crate::config::GatewayConfig;
use crate::handler::Handler;

/// Outbound SSE events buffered between the connection and the response body.
const EVENT_BUFFER: usize = 64;

/// Body stream of a push-only connection.
pub type EventStream = Pin<Box<dyn Stream<Item = std::result::Result<Event, Infallible>> + Send>>;

struct SseFrameWriter {
    tx: Option<mpsc::Sender<Event>>,
}

#[async_trait]
impl FrameWriter for SseFrameWriter {
    async fn write_message(&mut self, message: &Message) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(GatewayError::transport("event stream already closed"));
        };
        let (name, data) = message.to_sse()?;
        tx.send(Event::default().event(name).data(data))
            .await
            .map_err(|_| GatewayError::transport("event stream receiver dropped"))
    }

    async fn write_close(&mut self, _code: CloseCode) -> Result<()> {
        // Dropping the sender ends the response body once queued events drain.
        self.tx = None;
        Ok(())
    }
}

/// An SSE client connection.
pub struct EventStreamConnection {
    core: Arc<ConnectionCore>,
}

impl EventStreamConnection {
    /// Create the connection and the response body that carries its frames.
    pub fn open(handler: Arc<Handler>, config: &GatewayConfig) -> Result<(Arc<Self>, EventStream)> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let core = Arc::new(ConnectionCore::new(
            ConnectionKind::PushOnly,
            Box::new(SseFrameWriter { tx: Some(tx) }),
            handler,
            config,
        )?);

        let guard = core.drained().clone().drop_guard();
        let body = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|event| (Ok(event), (rx, guard)))
        });
        Ok((Arc::new(Self { core }), Box::pin(body)))
    }

    /// Greet, apply the URI subscriptions, start the background tasks and
    /// mark the connection ready.
    ///
    /// Rejected subscriptions are reported as `ERROR` events and do not stop
    /// the connection. A transport failure does.
    pub async fn start(&self, subscriptions: Vec<SubscribePayload>) -> Result<()> {
        let core = &self.core;
        core.greet().await?;
        for payload in subscriptions {
            if let Err(error) = core.handler().subscribe(core, payload).await {
                if error.is_fatal() {
                    return Err(error);
                }
                debug!(session_id = %core.session_id(), %error, "initial subscription failed");
            }
        }

        core.spawn_heartbeat();
        core.spawn_delivery();

        let watched = Arc::clone(core);
        let _ = tokio::spawn(async move {
            let ctx = watched.context_token().clone();
            tokio::select! {
                () = watched.drained().cancelled() => {
                    debug!(session_id = %watched.session_id(), "event stream client went away");
                    watched.close(CloseCode::Normal, Duration::ZERO).await;
                }
                () = ctx.cancelled() => {}
            }
        });

        if !core.mark_ready() {
            return Err(GatewayError::setup("connection closed during handshake"));
        }
        info!(
            session_id = %core.session_id(),
            subscriptions = core.subscription_count(),
            "event stream client connected"
        );
        Ok(())
    }
}

#[async_trait]
impl Connection for EventStreamConnection {
    fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Lifecycle;
    use crate::connection::tests::{test_config, test_handler};
    use futures::StreamExt;

    fn open() -> (Arc<EventStreamConnection>, EventStream) {
        let config = test_config();
        EventStreamConnection::open(test_handler(&config), &config).unwrap()
    }

    #[tokio::test]
    async fn initial_subscriptions_applied_before_ready() {
        let (conn, _body) = open();
        let ready = conn.on_ready();
        conn.start(vec![
            SubscribePayload::new("chat.message"),
            SubscribePayload::new("bad"),
            SubscribePayload::new("system.*"),
        ])
        .await
        .unwrap();

        assert!(ready.is_cancelled());
        assert_eq!(conn.core().state(), Lifecycle::Active);
        assert_eq!(conn.core().subscription_count(), 2);
        assert_eq!(conn.handler().bridge().channel_count(), 2);
        conn.close(CloseCode::Normal, Duration::ZERO).await;
    }

    #[tokio::test]
    async fn body_yields_frames_and_ends_on_close() {
        let (conn, mut body) = open();
        conn.start(vec![SubscribePayload::new("chat.message")])
            .await
            .unwrap();

        // hello + ack
        assert!(body.next().await.is_some());
        assert!(body.next().await.is_some());

        let closer = Arc::clone(&conn);
        let close = tokio::spawn(async move {
            closer.close(CloseCode::Restart, Duration::from_secs(5)).await;
        });
        // end-of-stream, then the body finishes
        assert!(body.next().await.is_some());
        assert!(body.next().await.is_none());
        drop(body);
        close.await.unwrap();

        assert!(conn.on_close().is_cancelled());
        for _ in 0..100 {
            if conn.handler().bridge().channel_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(conn.handler().bridge().channel_count(), 0);
    }

    #[tokio::test]
    async fn client_disconnect_closes_connection() {
        let (conn, body) = open();
        conn.start(vec![SubscribePayload::new("chat.message")])
            .await
            .unwrap();
        let closed = conn.on_close();
        drop(body);
        tokio::time::timeout(Duration::from_secs(5), closed.cancelled())
            .await
            .unwrap();
        assert_eq!(conn.core().state(), Lifecycle::Closed);
    }

    #[tokio::test]
    async fn greet_failure_is_setup_error() {
        let (conn, body) = open();
        drop(body);
        let result = conn.start(Vec::new()).await;
        assert!(matches!(result, Err(GatewayError::Setup(_))));
    }
}
