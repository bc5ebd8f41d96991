//! In-process message bus.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use crate::{BusError, MessageBus, PayloadStream};

/// Per-channel queue depth before slow subscribers start lagging.
const DEFAULT_CAPACITY: usize = 1024;

/// [`MessageBus`] backed by one `tokio::sync::broadcast` channel per name.
///
/// Only reaches subscribers in the same process. Names whose receivers have
/// all been dropped are pruned on the next publish.
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Arc<str>>>>,
    capacity: usize,
}

impl MemoryBus {
    /// Create a bus with the default per-channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with a custom per-channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of channel names with at least one live subscriber.
    pub fn channel_count(&self) -> usize {
        let mut channels = self.channels.lock();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        channels.len()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut channels = self.channels.lock();
        if let Some(tx) = channels.get(channel) {
            if tx.send(Arc::from(payload)).is_err() {
                let _ = channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, BusError> {
        let rx = {
            let mut channels = self.channels.lock();
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };
        let name = channel.to_string();
        let stream = futures::stream::unfold((rx, name), |(mut rx, name)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, (rx, name))),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(channel = %name, lagged = n, "memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
