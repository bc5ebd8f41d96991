//! Redis pub/sub message bus.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

use crate::{BusError, MessageBus, PayloadStream};

/// [`MessageBus`] over Redis `PUBLISH` / `SUBSCRIBE`.
///
/// Publishing shares one multiplexed connection. Each subscribed channel
/// gets its own pub/sub connection, closed when the stream is dropped.
pub struct RedisBus {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisBus {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        debug!(url, "connected to redis bus");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let name = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = msg.get_payload::<String>();
            let name = name.clone();
            async move {
                match payload {
                    Ok(text) => Some(Arc::<str>::from(text)),
                    Err(e) => {
                        warn!(channel = %name, error = %e, "dropping non-text redis payload");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
