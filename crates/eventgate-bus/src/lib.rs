//! # eventgate-bus
//!
//! Pub/sub plumbing between the external message bus and local connections.
//!
//! - [`MessageBus`]: the external substrate (publish + per-channel stream)
//! - [`MemoryBus`]: in-process implementation, used by default and in tests
//! - `RedisBus`: Redis pub/sub implementation (feature `redis`)
//! - [`PubSubBridge`]: reference-counted registry that opens one bus
//!   subscription per channel and fans payloads out to every local listener

#![deny(unsafe_code)]

pub mod bridge;
pub mod errors;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

pub use bridge::{BRIDGE_DROPS_TOTAL, ListenerHandle, PubSubBridge};
pub use errors::BusError;
pub use memory::MemoryBus;
#[cfg(feature = "redis")]
pub use self::redis::RedisBus;

/// Stream of raw payloads received on one bus channel.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Arc<str>> + Send>>;

/// External publish/subscribe substrate.
///
/// Payloads are opaque strings. Dropping a [`PayloadStream`] ends that
/// subscription on the backend.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `channel`. Succeeds with no subscribers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Open a live subscription to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, BusError>;
}
