//! Connection abstraction shared by the duplex and push-only transports.
//!
//! Both variants compose a [`ConnectionCore`] that owns the session id, the
//! lifecycle state machine, serialized writes, the subscription map, the
//! digest and the per-connection tasks (heartbeat and delivery). The
//! variants only add transport-specific plumbing around it.
//!
//! Lifecycle: `Created → Ready → Active → Closing → Closed`. The `ready`,
//! `closed`, `ctx` and `drained` signals are cancellation tokens: once fired
//! they satisfy every past and future waiter.

pub mod eventstream;
pub mod websocket;
mod writer;

pub use writer::FrameWriter;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eventgate_core::protocol::{AckPayload, DispatchPayload, ErrorPayload, HeartbeatPayload, HelloPayload};
use eventgate_core::{BusEvent, CloseCode, GatewayError, Message, Opcode, Result, SessionId};
use eventgate_settings::SubscriptionLimit;
use metrics::counter;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::digest::{self, EventDigest};
use crate::event_map::EventMap;
use crate::handler::Handler;
use crate::metrics::{DISPATCH_DEDUPLICATED_TOTAL, DISPATCH_TOTAL};

#[cfg(test)]
pub(crate) use writer::testing::Recorder;

/// Upper bound on writing the end-of-stream and close frames.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport variant of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
    /// WebSocket: client frames in, server frames out.
    Duplex,
    /// Server-sent events: server frames only.
    PushOnly,
}

impl ConnectionKind {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Duplex => "websocket",
            Self::PushOnly => "eventstream",
        }
    }
}

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Lifecycle {
    /// Constructed, handshake not finished.
    Created = 0,
    /// Handshake done, `ready` fired.
    Ready = 1,
    /// Serving traffic.
    Active = 2,
    /// Close sequence running.
    Closing = 3,
    /// Terminal.
    Closed = 4,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Ready,
            2 => Self::Active,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Authenticated principal attached to a connection by an external
/// authentication layer. Connections start without one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    /// Principal id.
    pub id: String,
}

/// State and behaviour shared by every connection variant.
pub struct ConnectionCore {
    session_id: SessionId,
    kind: ConnectionKind,
    state: AtomicU8,
    closing: AtomicBool,
    ready: CancellationToken,
    closed: CancellationToken,
    ctx: CancellationToken,
    drained: CancellationToken,
    heartbeat_interval: Duration,
    subscription_limit: SubscriptionLimit,
    heartbeat_count: AtomicU64,
    writer: tokio::sync::Mutex<Box<dyn FrameWriter>>,
    events: Mutex<EventMap>,
    digest: Mutex<EventDigest>,
    handler: Arc<Handler>,
    delivery_tx: mpsc::Sender<Arc<str>>,
    delivery_rx: Mutex<Option<mpsc::Receiver<Arc<str>>>>,
    actor: RwLock<Option<Actor>>,
    created_at: Instant,
}

impl ConnectionCore {
    /// Create a connection core writing through `writer`.
    ///
    /// Fails with a setup error if no session id can be generated.
    pub fn new(
        kind: ConnectionKind,
        writer: Box<dyn FrameWriter>,
        handler: Arc<Handler>,
        config: &GatewayConfig,
    ) -> Result<Self> {
        let session_id = SessionId::generate()?;
        let (delivery_tx, delivery_rx) = mpsc::channel(config.delivery_buffer.max(1));
        Ok(Self {
            session_id,
            kind,
            state: AtomicU8::new(Lifecycle::Created as u8),
            closing: AtomicBool::new(false),
            ready: CancellationToken::new(),
            closed: CancellationToken::new(),
            ctx: CancellationToken::new(),
            drained: CancellationToken::new(),
            heartbeat_interval: config.heartbeat_interval,
            subscription_limit: config.subscription_limit,
            heartbeat_count: AtomicU64::new(1),
            writer: tokio::sync::Mutex::new(writer),
            events: Mutex::new(EventMap::new()),
            digest: Mutex::new(EventDigest::new(config.digest_window)),
            handler,
            delivery_tx,
            delivery_rx: Mutex::new(Some(delivery_rx)),
            actor: RwLock::new(None),
            created_at: Instant::now(),
        })
    }

    /// Session id assigned at construction.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Transport variant.
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Subscription handler.
    pub fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    /// Token fired once the connection is ready.
    pub fn on_ready(&self) -> CancellationToken {
        self.ready.child_token()
    }

    /// Token fired once the connection is closed.
    pub fn on_close(&self) -> CancellationToken {
        self.closed.child_token()
    }

    /// Token cancelled at the end of the close sequence.
    pub fn context(&self) -> CancellationToken {
        self.ctx.child_token()
    }

    /// Attached principal, if any.
    pub fn actor(&self) -> Option<Actor> {
        self.actor.read().clone()
    }

    /// Attach or clear the principal.
    pub fn set_actor(&self, actor: Option<Actor>) {
        *self.actor.write() = actor;
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.events.lock().len()
    }

    pub(crate) fn events(&self) -> MutexGuard<'_, EventMap> {
        self.events.lock()
    }

    pub(crate) fn context_token(&self) -> &CancellationToken {
        &self.ctx
    }

    pub(crate) fn delivery_sender(&self) -> mpsc::Sender<Arc<str>> {
        self.delivery_tx.clone()
    }

    /// Signal that the peer has gone away or acknowledged the close.
    pub(crate) fn mark_drained(&self) {
        self.drained.cancel();
    }

    pub(crate) fn drained(&self) -> &CancellationToken {
        &self.drained
    }

    /// Write one message.
    ///
    /// Once the close sequence has started this is a no-op, so
    /// `END_OF_STREAM` stays the last frame on the wire.
    pub async fn write(&self, message: &Message) -> Result<()> {
        if self.is_closing() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        if self.is_closing() {
            return Ok(());
        }
        writer.write_message(message).await
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Send the `HELLO` handshake.
    pub async fn greet(&self) -> Result<()> {
        let hello = Message::Hello(HelloPayload {
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            session_id: self.session_id.clone(),
            subscription_limit: self.subscription_limit.advertised(),
        });
        self.write(&hello).await.map_err(GatewayError::setup)
    }

    /// Send the next `HEARTBEAT`.
    pub async fn send_heartbeat(&self) -> Result<()> {
        let count = self.heartbeat_count.fetch_add(1, Ordering::Relaxed);
        self.write(&Message::Heartbeat(HeartbeatPayload { count }))
            .await
    }

    /// Acknowledge a client command.
    pub async fn send_ack(&self, command: Opcode, data: Value) -> Result<()> {
        self.write(&Message::Ack(AckPayload {
            command: command.name().to_string(),
            data,
        }))
        .await
    }

    /// Report a rejected command. Failures are logged, not returned.
    pub async fn send_error(&self, message: &str, fields: BTreeMap<String, Value>) {
        let frame = Message::Error(ErrorPayload {
            message: message.to_string(),
            fields,
        });
        if let Err(error) = self.write(&frame).await {
            warn!(session_id = %self.session_id, %error, "failed to write error frame");
        }
    }

    /// Move `Created → Ready → Active` and fire `ready`.
    ///
    /// Returns `false` if the connection started closing first.
    pub(crate) fn mark_ready(&self) -> bool {
        if self
            .state
            .compare_exchange(
                Lifecycle::Created as u8,
                Lifecycle::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.ready.cancel();
        let _ = self.state.compare_exchange(
            Lifecycle::Ready as u8,
            Lifecycle::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug!(session_id = %self.session_id, transport = self.kind.as_str(), "connection ready");
        true
    }

    /// Run the close sequence once.
    ///
    /// Sends `END_OF_STREAM` and the transport close, then waits for the
    /// context, the drain signal or `grace`, whichever comes first. Later
    /// calls return immediately.
    pub async fn close(&self, code: CloseCode, grace: Duration) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.store(Lifecycle::Closing as u8, Ordering::Release);

        let frames = tokio::time::timeout(CLOSE_WRITE_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            let eos = Message::EndOfStream(code.into());
            if let Err(error) = writer.write_message(&eos).await {
                debug!(session_id = %self.session_id, %error, "end-of-stream not delivered");
            }
            if let Err(error) = writer.write_close(code).await {
                debug!(session_id = %self.session_id, %error, "transport close not delivered");
            }
        })
        .await;
        if frames.is_err() {
            warn!(session_id = %self.session_id, "timed out writing close frames");
        }

        if !grace.is_zero() {
            tokio::select! {
                () = self.ctx.cancelled() => {}
                () = self.drained.cancelled() => {}
                () = tokio::time::sleep(grace) => {
                    debug!(session_id = %self.session_id, "close grace period elapsed");
                }
            }
        }

        self.ctx.cancel();
        self.state.store(Lifecycle::Closed as u8, Ordering::Release);
        self.closed.cancel();

        let lifetime_secs = self.created_at.elapsed().as_secs_f64();
        if code.is_error() {
            warn!(
                session_id = %self.session_id,
                transport = self.kind.as_str(),
                code = code.code(),
                lifetime_secs,
                "connection closed: {}", code.reason()
            );
        } else {
            info!(
                session_id = %self.session_id,
                transport = self.kind.as_str(),
                code = code.code(),
                lifetime_secs,
                "connection closed"
            );
        }
    }

    /// Spawn the heartbeat task.
    pub(crate) fn spawn_heartbeat(self: &Arc<Self>) {
        let core = Arc::clone(self);
        let _ = tokio::spawn(async move {
            let period = core.heartbeat_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = core.ctx.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = core.send_heartbeat().await {
                            warn!(session_id = %core.session_id, %error, "heartbeat failed");
                            core.close(CloseCode::ServerError, Duration::ZERO).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Spawn the task that turns bus payloads into `DISPATCH` frames.
    pub(crate) fn spawn_delivery(self: &Arc<Self>) {
        let Some(mut rx) = self.delivery_rx.lock().take() else {
            return;
        };
        let core = Arc::clone(self);
        let _ = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = core.ctx.cancelled() => break,
                    payload = rx.recv() => {
                        let Some(payload) = payload else { break };
                        if let Err(error) = core.deliver(&payload).await {
                            debug!(session_id = %core.session_id, %error, "dispatch write failed");
                            core.close(CloseCode::ServerError, Duration::ZERO).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Deliver one bus payload. Returns whether a `DISPATCH` was written.
    pub(crate) async fn deliver(&self, payload: &str) -> Result<bool> {
        let event: BusEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(error) => {
                warn!(session_id = %self.session_id, %error, "dropping undecodable bus payload");
                return Ok(false);
            }
        };

        let matched = !self
            .events
            .lock()
            .matches(&event.event_type, &event.attributes)
            .is_empty();
        if !matched {
            return Ok(false);
        }

        let identity = digest::identity(payload, &event.event_type, event.hash.as_deref());
        let fresh = self.digest.lock().should_deliver(&identity);
        if !fresh {
            counter!(DISPATCH_DEDUPLICATED_TOTAL).increment(1);
            return Ok(false);
        }

        self.write(&Message::Dispatch(DispatchPayload {
            event_type: event.event_type.to_string(),
            body: event.body,
        }))
        .await?;
        counter!(DISPATCH_TOTAL, "transport" => self.kind.as_str()).increment(1);
        Ok(true)
    }
}

/// Contract shared by both connection variants.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Shared core.
    fn core(&self) -> &Arc<ConnectionCore>;

    /// Session id.
    fn session_id(&self) -> &SessionId {
        self.core().session_id()
    }

    /// Transport variant.
    fn kind(&self) -> ConnectionKind {
        self.core().kind()
    }

    /// Send the `HELLO` handshake.
    async fn greet(&self) -> Result<()> {
        self.core().greet().await
    }

    /// Send the next heartbeat.
    async fn send_heartbeat(&self) -> Result<()> {
        self.core().send_heartbeat().await
    }

    /// Acknowledge a command.
    async fn send_ack(&self, command: Opcode, data: Value) -> Result<()> {
        self.core().send_ack(command, data).await
    }

    /// Report a rejected command (best effort).
    async fn send_error(&self, message: &str, fields: BTreeMap<String, Value>) {
        self.core().send_error(message, fields).await;
    }

    /// Write one message.
    async fn write(&self, message: &Message) -> Result<()> {
        self.core().write(message).await
    }

    /// Close the connection; idempotent.
    async fn close(&self, code: CloseCode, grace: Duration) {
        self.core().close(code, grace).await;
    }

    /// Fired once the connection is ready.
    fn on_ready(&self) -> CancellationToken {
        self.core().on_ready()
    }

    /// Fired once the connection is closed.
    fn on_close(&self) -> CancellationToken {
        self.core().on_close()
    }

    /// Cancelled at the end of the close sequence.
    fn context(&self) -> CancellationToken {
        self.core().context()
    }

    /// Attached principal.
    fn actor(&self) -> Option<Actor> {
        self.core().actor()
    }

    /// Attach or clear the principal.
    fn set_actor(&self, actor: Option<Actor>) {
        self.core().set_actor(actor);
    }

    /// Subscription handler.
    fn handler(&self) -> &Arc<Handler> {
        self.core().handler()
    }
}
