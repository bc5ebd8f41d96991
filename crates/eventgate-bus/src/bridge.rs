//! Reference-counted bridge from the shared bus to local listeners.
//!
//! The bridge keeps one registry entry per bus channel. The first listener
//! for a channel opens the bus subscription and starts a forwarding task;
//! every later listener only joins the entry. When the last listener leaves,
//! the entry is removed and the forwarder stops, which drops the bus stream.
//!
//! Listeners that join while the bus subscription is still opening wait for
//! the same outcome as the first listener and fail with it.
//!
//! Registry mutations happen under a single `parking_lot::Mutex` that is never
//! held across an `.await`. No channel name ever maps to an empty listener set.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use eventgate_core::BusEvent;
use futures::StreamExt;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{BusError, MessageBus, PayloadStream};

/// Bus payloads dropped because a listener queue was full (counter).
pub const BRIDGE_DROPS_TOTAL: &str = "eventgate_bridge_drops_total";

/// Outcome of opening a channel's bus subscription; `None` while pending.
type OpenState = Option<Result<(), BusError>>;

/// Handle identifying one listener registration.
///
/// Pass it to [`PubSubBridge::unsubscribe`] to leave explicitly; the
/// registration is also removed when the context it was created with is
/// cancelled.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    id: u64,
    channel: String,
}

impl ListenerHandle {
    /// Bus channel this listener is registered on.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

struct Listener {
    delivery: mpsc::Sender<Arc<str>>,
    released: CancellationToken,
}

struct ChannelEntry {
    listeners: HashMap<u64, Listener>,
    forwarder: CancellationToken,
    generation: u64,
    opened: watch::Receiver<OpenState>,
}

enum Join {
    First {
        forwarder: CancellationToken,
        generation: u64,
        opened: watch::Sender<OpenState>,
    },
    Joiner(watch::Receiver<OpenState>),
}

struct Inner {
    bus: Arc<dyn MessageBus>,
    registry: Mutex<HashMap<String, ChannelEntry>>,
    next_id: AtomicU64,
    drops: AtomicU64,
}

/// Shared bridge between a [`MessageBus`] and per-connection delivery queues.
///
/// Cheap to clone; clones share one registry. Create one per process and
/// inject it into the components that need it.
#[derive(Clone)]
pub struct PubSubBridge {
    inner: Arc<Inner>,
}

impl PubSubBridge {
    /// Create a bridge over `bus`.
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                drops: AtomicU64::new(0),
            }),
        }
    }

    /// Register `delivery` as a listener on `channel`.
    ///
    /// Returns once the channel's bus subscription is open, so anything
    /// published after this returns is delivered. If opening fails, every
    /// listener that joined meanwhile gets the error and is not registered.
    /// The listener is removed automatically when `ctx` is cancelled.
    pub async fn subscribe(
        &self,
        ctx: &CancellationToken,
        delivery: mpsc::Sender<Arc<str>>,
        channel: &str,
    ) -> Result<ListenerHandle, BusError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let released = CancellationToken::new();
        let listener = Listener {
            delivery,
            released: released.clone(),
        };

        let join = {
            let mut registry = self.inner.registry.lock();
            match registry.entry(channel.to_string()) {
                Entry::Occupied(mut entry) => {
                    let entry = entry.get_mut();
                    let _ = entry.listeners.insert(id, listener);
                    Join::Joiner(entry.opened.clone())
                }
                Entry::Vacant(entry) => {
                    let forwarder = CancellationToken::new();
                    let generation = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let (opened, opened_rx) = watch::channel(None);
                    let _ = entry.insert(ChannelEntry {
                        listeners: HashMap::from([(id, listener)]),
                        forwarder: forwarder.clone(),
                        generation,
                        opened: opened_rx,
                    });
                    Join::First {
                        forwarder,
                        generation,
                        opened,
                    }
                }
            }
        };

        match join {
            Join::First {
                forwarder,
                generation,
                opened,
            } => {
                debug!(channel, "opening bus subscription");
                let (ready_tx, ready_rx) = oneshot::channel();
                let _ = tokio::spawn(Inner::run_forwarder(
                    Arc::clone(&self.inner),
                    channel.to_string(),
                    forwarder,
                    generation,
                    opened,
                    ready_tx,
                ));
                ready_rx.await.map_err(|_| BusError::Closed)??;
            }
            Join::Joiner(opened) => wait_opened(opened).await?,
        }

        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let name = channel.to_string();
        let _ = tokio::spawn(async move {
            tokio::select! {
                () = ctx.cancelled() => {
                    let _ = inner.remove_listener(&name, id);
                }
                () = released.cancelled() => {}
            }
        });

        Ok(ListenerHandle {
            id,
            channel: channel.to_string(),
        })
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: &ListenerHandle) -> bool {
        self.inner.remove_listener(&handle.channel, handle.id)
    }

    /// Publish a raw payload on `channel`, whether or not anyone here listens.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        self.inner.bus.publish(channel, payload).await
    }

    /// Publish an event on its exact channel and every enclosing wildcard channel.
    pub async fn publish_event(&self, event: &BusEvent) -> Result<(), BusError> {
        let payload = serde_json::to_string(event)?;
        for channel in event.channels() {
            self.publish(&channel, &payload).await?;
        }
        Ok(())
    }

    /// Number of channels with at least one local listener.
    pub fn channel_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Number of local listeners on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.inner
            .registry
            .lock()
            .get(channel)
            .map_or(0, |entry| entry.listeners.len())
    }

    /// Payloads dropped so far because a listener queue was full.
    pub fn dropped_payloads(&self) -> u64 {
        self.inner.drops.load(Ordering::Relaxed)
    }

    /// Drop every registration and stop all forwarders.
    pub fn close(&self) {
        let drained: Vec<ChannelEntry> = {
            let mut registry = self.inner.registry.lock();
            registry.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.cancel();
        }
    }
}

async fn wait_opened(mut opened: watch::Receiver<OpenState>) -> Result<(), BusError> {
    let state = opened
        .wait_for(Option::is_some)
        .await
        .map_err(|_| BusError::Closed)?;
    match &*state {
        Some(Err(error)) => Err(error.replicate()),
        _ => Ok(()),
    }
}

impl ChannelEntry {
    fn cancel(&self) {
        self.forwarder.cancel();
        for listener in self.listeners.values() {
            listener.released.cancel();
        }
    }
}

impl Inner {
    fn remove_listener(&self, channel: &str, id: u64) -> bool {
        let mut registry = self.registry.lock();
        let Some(entry) = registry.get_mut(channel) else {
            return false;
        };
        let Some(listener) = entry.listeners.remove(&id) else {
            return false;
        };
        listener.released.cancel();
        if entry.listeners.is_empty() {
            if let Some(entry) = registry.remove(channel) {
                entry.forwarder.cancel();
            }
            debug!(channel, "last listener left, closing bus subscription");
        }
        true
    }

    fn remove_channel(&self, channel: &str, generation: u64) {
        let mut registry = self.registry.lock();
        if registry
            .get(channel)
            .is_some_and(|entry| entry.generation == generation)
        {
            if let Some(entry) = registry.remove(channel) {
                entry.cancel();
            }
        }
    }

    fn fan_out(&self, channel: &str, payload: &Arc<str>) {
        let targets: Vec<mpsc::Sender<Arc<str>>> = {
            let registry = self.registry.lock();
            match registry.get(channel) {
                Some(entry) => entry.listeners.values().map(|l| l.delivery.clone()).collect(),
                None => return,
            }
        };
        for target in targets {
            match target.try_send(Arc::clone(payload)) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let _ = self.drops.fetch_add(1, Ordering::Relaxed);
                    counter!(BRIDGE_DROPS_TOTAL).increment(1);
                    debug!(channel, "listener queue full, dropping payload");
                }
            }
        }
    }

    async fn run_forwarder(
        self: Arc<Self>,
        channel: String,
        forwarder: CancellationToken,
        generation: u64,
        opened: watch::Sender<OpenState>,
        ready: oneshot::Sender<Result<(), BusError>>,
    ) {
        let mut stream: PayloadStream = match self.bus.subscribe(&channel).await {
            Ok(_) if forwarder.is_cancelled() => {
                // every listener left or the bridge closed while opening
                let _ = opened.send(Some(Err(BusError::Closed)));
                let _ = ready.send(Err(BusError::Closed));
                return;
            }
            Ok(stream) => {
                let _ = opened.send(Some(Ok(())));
                let _ = ready.send(Ok(()));
                stream
            }
            Err(e) => {
                warn!(channel, error = %e, "bus subscribe failed");
                self.remove_channel(&channel, generation);
                let _ = opened.send(Some(Err(e.replicate())));
                let _ = ready.send(Err(e));
                return;
            }
        };

        loop {
            tokio::select! {
                () = forwarder.cancelled() => break,
                next = stream.next() => match next {
                    Some(payload) => self.fan_out(&channel, &payload),
                    None => {
                        warn!(channel, "bus stream ended");
                        self.remove_channel(&channel, generation);
                        break;
                    }
                },
            }
        }
        debug!(channel, "forwarder stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBus;
    use async_trait::async_trait;
    use assert_matches::assert_matches;
    use eventgate_core::EventType;
    use std::time::Duration;

    fn bridge() -> (Arc<MemoryBus>, PubSubBridge) {
        let bus = Arc::new(MemoryBus::new());
        let bridge = PubSubBridge::new(bus.clone());
        (bus, bridge)
    }

    async fn recv(rx: &mut mpsc::Receiver<Arc<str>>) -> Arc<str> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for payload")
            .expect("delivery channel closed")
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn single_subscriber_receives_and_cleans_up() {
        let (_bus, bridge) = bridge();
        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        let _handle = bridge.subscribe(&ctx, tx, "events:xd").await.unwrap();
        bridge.publish("events:xd", "pog").await.unwrap();
        assert_eq!(&*recv(&mut rx).await, "pog");

        ctx.cancel();
        wait_until(|| bridge.channel_count() == 0).await;
        assert_eq!(bridge.listener_count("events:xd"), 0);
    }

    #[tokio::test]
    async fn reference_counting() {
        let (bus, bridge) = bridge();
        let ctx = CancellationToken::new();
        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel(8);
            handles.push(bridge.subscribe(&ctx, tx, "events:x").await.unwrap());
            receivers.push(rx);
        }
        assert_eq!(bridge.listener_count("events:x"), 3);
        assert_eq!(bus.channel_count(), 1);

        assert!(bridge.unsubscribe(&handles[0]));
        assert!(bridge.unsubscribe(&handles[1]));
        assert_eq!(bridge.channel_count(), 1);
        assert_eq!(bridge.listener_count("events:x"), 1);

        bridge.publish("events:x", "still here").await.unwrap();
        assert_eq!(&*recv(&mut receivers[2]).await, "still here");

        assert!(bridge.unsubscribe(&handles[2]));
        assert_eq!(bridge.channel_count(), 0);
        assert_eq!(bridge.listener_count("events:x"), 0);

        // forwarder drops the bus stream once cancelled
        wait_until(|| bus.channel_count() == 0).await;
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let (_bus, bridge) = bridge();
        let ctx = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);
        let handle = bridge.subscribe(&ctx, tx, "events:x").await.unwrap();
        assert!(bridge.unsubscribe(&handle));
        assert!(!bridge.unsubscribe(&handle));
        ctx.cancel();
        tokio::task::yield_now().await;
        assert_eq!(bridge.channel_count(), 0);
    }

    #[tokio::test]
    async fn fans_out_to_every_listener() {
        let (_bus, bridge) = bridge();
        let ctx = CancellationToken::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let _h1 = bridge.subscribe(&ctx, tx1, "events:x").await.unwrap();
        let _h2 = bridge.subscribe(&ctx, tx2, "events:x").await.unwrap();

        bridge.publish("events:x", "both").await.unwrap();
        assert_eq!(&*recv(&mut rx1).await, "both");
        assert_eq!(&*recv(&mut rx2).await, "both");
    }

    #[tokio::test]
    async fn full_listener_does_not_block_others() {
        let (_bus, bridge) = bridge();
        let ctx = CancellationToken::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let _slow = bridge.subscribe(&ctx, slow_tx, "events:x").await.unwrap();
        let _fast = bridge.subscribe(&ctx, fast_tx, "events:x").await.unwrap();

        for i in 0..3 {
            bridge.publish("events:x", &i.to_string()).await.unwrap();
        }
        for i in 0..3 {
            assert_eq!(&*recv(&mut fast_rx).await, i.to_string());
        }
        wait_until(|| bridge.dropped_payloads() == 2).await;
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_succeeds() {
        let (_bus, bridge) = bridge();
        bridge.publish("events:empty", "x").await.unwrap();
        assert_eq!(bridge.channel_count(), 0);
    }

    #[tokio::test]
    async fn publish_event_hits_exact_and_wildcard_channels() {
        let (_bus, bridge) = bridge();
        let ctx = CancellationToken::new();
        let (exact_tx, mut exact_rx) = mpsc::channel(8);
        let (wild_tx, mut wild_rx) = mpsc::channel(8);
        let _e = bridge
            .subscribe(&ctx, exact_tx, "events:dispatch:chat.message")
            .await
            .unwrap();
        let _w = bridge
            .subscribe(&ctx, wild_tx, "events:dispatch:chat.*")
            .await
            .unwrap();

        let event = BusEvent::new(
            EventType::parse("chat.message").unwrap(),
            serde_json::json!({"text": "hi"}),
        );
        bridge.publish_event(&event).await.unwrap();

        let exact: BusEvent = serde_json::from_str(&recv(&mut exact_rx).await).unwrap();
        let wild: BusEvent = serde_json::from_str(&recv(&mut wild_rx).await).unwrap();
        assert_eq!(exact, event);
        assert_eq!(wild, event);
    }

    #[tokio::test]
    async fn close_clears_registry() {
        let (_bus, bridge) = bridge();
        let ctx = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);
        let handle = bridge.subscribe(&ctx, tx, "events:x").await.unwrap();
        bridge.close();
        assert_eq!(bridge.channel_count(), 0);
        assert!(!bridge.unsubscribe(&handle));
    }

    struct FailingBus;

    #[async_trait]
    impl MessageBus for FailingBus {
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), BusError> {
            Err(BusError::Backend("down".into()))
        }

        async fn subscribe(&self, _channel: &str) -> Result<PayloadStream, BusError> {
            Err(BusError::Backend("down".into()))
        }
    }

    #[tokio::test]
    async fn bus_failures_surface_and_leave_no_entry() {
        let bridge = PubSubBridge::new(Arc::new(FailingBus));
        let ctx = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);

        let err = bridge.subscribe(&ctx, tx, "events:x").await.unwrap_err();
        assert_matches!(err, BusError::Backend(_));
        assert_eq!(bridge.channel_count(), 0);

        assert_matches!(bridge.publish("events:x", "p").await, Err(BusError::Backend(_)));
    }

    /// Holds every `subscribe` until a permit is added, then opens on the
    /// inner memory bus or fails.
    struct GatedBus {
        inner: MemoryBus,
        gate: tokio::sync::Semaphore,
        fail: std::sync::atomic::AtomicBool,
    }

    impl GatedBus {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryBus::new(),
                gate: tokio::sync::Semaphore::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }

        fn open(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
            self.gate.add_permits(1);
        }
    }

    #[async_trait]
    impl MessageBus for GatedBus {
        async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<PayloadStream, BusError> {
            self.gate.acquire().await.map_err(|_| BusError::Closed)?.forget();
            if self.fail.load(Ordering::SeqCst) {
                return Err(BusError::Backend("down".into()));
            }
            self.inner.subscribe(channel).await
        }
    }

    type Pending = tokio::task::JoinHandle<Result<ListenerHandle, BusError>>;

    fn spawn_subscribe(
        bridge: &PubSubBridge,
        ctx: &CancellationToken,
        tx: mpsc::Sender<Arc<str>>,
    ) -> Pending {
        let bridge = bridge.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { bridge.subscribe(&ctx, tx, "events:x").await })
    }

    #[tokio::test]
    async fn joiner_waits_for_open_and_receives() {
        let bus = GatedBus::new();
        let bridge = PubSubBridge::new(bus.clone());
        let ctx = CancellationToken::new();
        let (first_tx, _first_rx) = mpsc::channel(8);
        let (joiner_tx, mut joiner_rx) = mpsc::channel(8);

        let first = spawn_subscribe(&bridge, &ctx, first_tx);
        wait_until(|| bridge.listener_count("events:x") == 1).await;
        let joiner = spawn_subscribe(&bridge, &ctx, joiner_tx);
        wait_until(|| bridge.listener_count("events:x") == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!joiner.is_finished(), "joiner returned before the bus was open");

        bus.open(false);
        let _first = first.await.unwrap().unwrap();
        let _joiner = joiner.await.unwrap().unwrap();

        bridge.publish("events:x", "after-open").await.unwrap();
        assert_eq!(&*recv(&mut joiner_rx).await, "after-open");
    }

    #[tokio::test]
    async fn failed_open_is_reported_to_joiners() {
        let bus = GatedBus::new();
        let bridge = PubSubBridge::new(bus.clone());
        let ctx = CancellationToken::new();
        let (first_tx, _first_rx) = mpsc::channel(8);
        let (joiner_tx, _joiner_rx) = mpsc::channel(8);

        let first = spawn_subscribe(&bridge, &ctx, first_tx);
        wait_until(|| bridge.listener_count("events:x") == 1).await;
        let joiner = spawn_subscribe(&bridge, &ctx, joiner_tx);
        wait_until(|| bridge.listener_count("events:x") == 2).await;

        bus.open(true);
        assert_matches!(first.await.unwrap(), Err(BusError::Backend(reason)) if reason == "down");
        assert_matches!(joiner.await.unwrap(), Err(BusError::Backend(reason)) if reason == "down");
        assert_eq!(bridge.channel_count(), 0);

        // a later subscribe opens a fresh bus subscription
        let (retry_tx, mut retry_rx) = mpsc::channel(8);
        let retry = spawn_subscribe(&bridge, &ctx, retry_tx);
        bus.open(false);
        let _retry = retry.await.unwrap().unwrap();
        bridge.publish("events:x", "recovered").await.unwrap();
        assert_eq!(&*recv(&mut retry_rx).await, "recovered");
    }
}
