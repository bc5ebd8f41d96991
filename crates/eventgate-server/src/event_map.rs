//! Per-connection subscription registry.
//!
//! Holds the active [`Subscription`]s of one connection, keyed by
//! `(event type, condition)`, and counts how many of them share each bus
//! channel. The bridge listener for a channel is kept here and handed back
//! when the last subscription on that channel goes away.

use std::collections::{BTreeMap, HashMap};
use std::collections::hash_map::Entry;

use chrono::{DateTime, Utc};
use eventgate_bus::ListenerHandle;
use eventgate_core::{Condition, EventType};

/// One active subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    /// Subscribed type, possibly wildcarded.
    pub event_type: EventType,
    /// Attribute constraints; empty matches every event of the type.
    pub condition: Condition,
    /// When the subscription was accepted.
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// New subscription created now.
    pub fn new(event_type: EventType, condition: Condition) -> Self {
        Self {
            event_type,
            condition,
            created_at: Utc::now(),
        }
    }

    /// Bus channel this subscription listens on.
    pub fn channel(&self) -> String {
        self.event_type.channel()
    }

    /// Whether an event of `event_type` with `attributes` satisfies this subscription.
    pub fn matches(&self, event_type: &EventType, attributes: &BTreeMap<String, String>) -> bool {
        self.event_type.matches(event_type)
            && self
                .condition
                .iter()
                .all(|(key, value)| attributes.get(key) == Some(value))
    }
}

#[derive(Debug, Default)]
struct ChannelRef {
    refs: usize,
    handle: Option<ListenerHandle>,
}

/// Outcome of a removal.
#[derive(Debug, Default)]
pub struct Removed {
    /// Subscriptions removed.
    pub count: usize,
    /// Bridge listeners no longer referenced by any subscription.
    pub released: Vec<ListenerHandle>,
}

/// Registry of one connection's subscriptions.
#[derive(Debug, Default)]
pub struct EventMap {
    subscriptions: HashMap<(EventType, Condition), Subscription>,
    channels: HashMap<String, ChannelRef>,
}

impl EventMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Whether `(event_type, condition)` is subscribed.
    pub fn contains(&self, event_type: &EventType, condition: &Condition) -> bool {
        self.subscriptions
            .contains_key(&(event_type.clone(), condition.clone()))
    }

    /// Whether a bridge listener is already held for `channel`.
    pub fn is_listening(&self, channel: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|entry| entry.handle.is_some())
    }

    /// Number of subscriptions sharing `channel`.
    pub fn channel_refs(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |entry| entry.refs)
    }

    /// Insert a subscription, attaching `handle` to its channel if the
    /// channel has no listener yet.
    ///
    /// Returns a handle the caller must release: the passed one when the
    /// channel already had a listener or the subscription already existed.
    pub fn insert(
        &mut self,
        subscription: Subscription,
        handle: Option<ListenerHandle>,
    ) -> Option<ListenerHandle> {
        let key = (subscription.event_type.clone(), subscription.condition.clone());
        if self.subscriptions.contains_key(&key) {
            return handle;
        }
        let channel = subscription.channel();
        let _ = self.subscriptions.insert(key, subscription);

        let entry = self.channels.entry(channel).or_default();
        entry.refs += 1;
        if entry.handle.is_none() {
            entry.handle = handle;
            None
        } else {
            handle
        }
    }

    /// Remove the exact `(event_type, condition)` subscription.
    pub fn remove(&mut self, event_type: &EventType, condition: &Condition) -> Removed {
        let mut removed = Removed::default();
        if let Some(sub) = self
            .subscriptions
            .remove(&(event_type.clone(), condition.clone()))
        {
            self.release(&sub, &mut removed);
        }
        removed
    }

    /// Remove every subscription of `event_type`, whatever its condition.
    pub fn remove_type(&mut self, event_type: &EventType) -> Removed {
        let keys: Vec<_> = self
            .subscriptions
            .keys()
            .filter(|(t, _)| t == event_type)
            .cloned()
            .collect();
        let mut removed = Removed::default();
        for key in keys {
            if let Some(sub) = self.subscriptions.remove(&key) {
                self.release(&sub, &mut removed);
            }
        }
        removed
    }

    /// Subscriptions matched by an event.
    pub fn matches(
        &self,
        event_type: &EventType,
        attributes: &BTreeMap<String, String>,
    ) -> Vec<&Subscription> {
        self.subscriptions
            .values()
            .filter(|sub| sub.matches(event_type, attributes))
            .collect()
    }

    /// Iterate over the active subscriptions.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    fn release(&mut self, sub: &Subscription, removed: &mut Removed) {
        removed.count += 1;
        let channel = sub.channel();
        if let Entry::Occupied(mut entry) = self.channels.entry(channel) {
            entry.get_mut().refs = entry.get().refs.saturating_sub(1);
            if entry.get().refs == 0 {
                if let Some(handle) = entry.remove().handle {
                    removed.released.push(handle);
                }
            }
        }
    }
}
