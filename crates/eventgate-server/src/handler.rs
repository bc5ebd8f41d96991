//! Subscribe / unsubscribe command handling.
//!
//! The [`Handler`] validates client commands against the connection's
//! [`EventMap`](crate::event_map::EventMap) and the subscription limit, and
//! keeps the bridge registrations in step: the first subscription on a bus
//! channel registers the connection's delivery queue with the bridge, the
//! last one leaving releases it.

use std::collections::BTreeMap;

use eventgate_bus::PubSubBridge;
use eventgate_core::protocol::SubscribePayload;
use eventgate_core::{CloseCode, EventType, GatewayError, Opcode, Result};
use eventgate_settings::SubscriptionLimit;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::connection::ConnectionCore;
use crate::event_map::Subscription;

/// Error message for an event type that fails validation.
pub const INVALID_EVENT_TYPE: &str = "Invalid Event Type";
/// Error message when the subscription limit is reached.
pub const TOO_MANY_SUBSCRIPTIONS: &str = "Too Many Active Subscriptions!";
/// Error message when the bus refuses a subscription.
pub const SUBSCRIPTION_FAILED: &str = "Subscription Failed";

enum Rejection {
    LimitReached,
    Duplicate,
}

/// Applies subscription commands for every connection of a server.
pub struct Handler {
    bridge: PubSubBridge,
    limit: SubscriptionLimit,
}

impl Handler {
    /// Create a handler using `bridge` and a per-connection `limit`.
    pub fn new(bridge: PubSubBridge, limit: SubscriptionLimit) -> Self {
        Self { bridge, limit }
    }

    /// The shared bridge.
    pub fn bridge(&self) -> &PubSubBridge {
        &self.bridge
    }

    /// Per-connection subscription limit.
    pub fn limit(&self) -> SubscriptionLimit {
        self.limit
    }

    /// Apply a `SUBSCRIBE`.
    ///
    /// Returns `Ok(false)` after sending an `ERROR` frame when the command is
    /// rejected; the subscription map is left untouched in that case.
    pub async fn subscribe(&self, conn: &ConnectionCore, payload: SubscribePayload) -> Result<bool> {
        let Ok(event_type) = EventType::parse(&payload.event_type) else {
            conn.send_error(INVALID_EVENT_TYPE, type_fields(&payload)).await;
            return Ok(false);
        };

        let rejection = {
            let events = conn.events();
            if self.limit.is_reached(events.len()) {
                Some(Rejection::LimitReached)
            } else if events.contains(&event_type, &payload.condition) {
                Some(Rejection::Duplicate)
            } else {
                None
            }
        };
        match rejection {
            Some(Rejection::LimitReached) => {
                let mut fields = BTreeMap::new();
                let _ = fields.insert("limit".to_string(), json!(self.limit.advertised()));
                conn.send_error(TOO_MANY_SUBSCRIPTIONS, fields).await;
                return Ok(false);
            }
            Some(Rejection::Duplicate) => {
                let mut fields = condition_fields(&payload);
                let _ = fields.insert("code".to_string(), json!(CloseCode::AlreadySubscribed.code()));
                conn.send_error(CloseCode::AlreadySubscribed.reason(), fields)
                    .await;
                return Ok(false);
            }
            None => {}
        }

        let channel = event_type.channel();
        let listening = conn.events().is_listening(&channel);
        let handle = if listening {
            None
        } else {
            match self
                .bridge
                .subscribe(conn.context_token(), conn.delivery_sender(), &channel)
                .await
            {
                Ok(handle) => Some(handle),
                Err(error) => {
                    warn!(session_id = %conn.session_id(), channel, %error, "bus subscription failed");
                    conn.send_error(SUBSCRIPTION_FAILED, type_fields(&payload))
                        .await;
                    return Err(GatewayError::from(error));
                }
            }
        };

        let surplus = conn.events().insert(
            Subscription::new(event_type, payload.condition.clone()),
            handle,
        );
        if let Some(handle) = surplus {
            let _ = self.bridge.unsubscribe(&handle);
        }

        debug!(session_id = %conn.session_id(), event_type = %payload.event_type, "subscribed");
        conn.send_ack(Opcode::Subscribe, echo(&payload)).await?;
        Ok(true)
    }

    /// Apply an `UNSUBSCRIBE`.
    ///
    /// An empty condition removes every subscription of the type.
    pub async fn unsubscribe(&self, conn: &ConnectionCore, payload: SubscribePayload) -> Result<bool> {
        let Ok(event_type) = EventType::parse(&payload.event_type) else {
            conn.send_error(INVALID_EVENT_TYPE, type_fields(&payload)).await;
            return Ok(false);
        };

        let removed = {
            let mut events = conn.events();
            if payload.condition.is_empty() {
                events.remove_type(&event_type)
            } else {
                events.remove(&event_type, &payload.condition)
            }
        };
        if removed.count == 0 {
            let mut fields = condition_fields(&payload);
            let _ = fields.insert("code".to_string(), json!(CloseCode::NotSubscribed.code()));
            conn.send_error(CloseCode::NotSubscribed.reason(), fields).await;
            return Ok(false);
        }
        for handle in &removed.released {
            let _ = self.bridge.unsubscribe(handle);
        }

        debug!(
            session_id = %conn.session_id(),
            event_type = %payload.event_type,
            removed = removed.count,
            "unsubscribed"
        );
        conn.send_ack(Opcode::Unsubscribe, echo(&payload)).await?;
        Ok(true)
    }

    /// Apply a `RESUME`. Sessions are never resumed.
    pub async fn resume(&self, conn: &ConnectionCore) -> Result<bool> {
        conn.send_ack(Opcode::Resume, json!({ "success": false })).await?;
        Ok(false)
    }
}

fn echo(payload: &SubscribePayload) -> Value {
    json!({ "type": payload.event_type, "condition": payload.condition })
}

fn type_fields(payload: &SubscribePayload) -> BTreeMap<String, Value> {
    BTreeMap::from([("type".to_string(), json!(payload.event_type))])
}

fn condition_fields(payload: &SubscribePayload) -> BTreeMap<String, Value> {
    let mut fields = type_fields(payload);
    let _ = fields.insert("condition".to_string(), json!(payload.condition));
    fields
}
