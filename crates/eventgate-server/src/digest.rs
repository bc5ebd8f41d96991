//! Per-connection de-duplication of dispatched events.
//!
//! An event can reach a connection more than once: it is published on its
//! exact channel and on every enclosing wildcard channel, and several
//! subscriptions may match it. [`EventDigest`] remembers the identity of
//! each delivered event for a short window so the connection writes it once.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use eventgate_core::EventType;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Deterministic identity of a bus payload for a given event type.
///
/// A publisher-supplied hash is trusted as-is; otherwise the raw payload is
/// hashed with SHA-256.
pub fn identity(payload: &str, event_type: &EventType, publisher_hash: Option<&str>) -> String {
    match publisher_hash {
        Some(hash) if !hash.is_empty() => format!("{event_type}:{hash}"),
        _ => {
            let mut hasher = Sha256::new();
            hasher.update(event_type.as_str().as_bytes());
            hasher.update(b"\n");
            hasher.update(payload.as_bytes());
            hex::encode(hasher.finalize())
        }
    }
}

/// Time-windowed set of recently delivered identities.
#[derive(Debug)]
pub struct EventDigest {
    window: Duration,
    seen: HashMap<String, Instant>,
    order: VecDeque<(Instant, String)>,
}

impl EventDigest {
    /// Create a digest that suppresses repeats for `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` and records `identity` the first time it is seen within
    /// the window, `false` for every repeat until it expires.
    pub fn should_deliver(&mut self, identity: &str) -> bool {
        let now = Instant::now();
        self.prune(now);
        if self.seen.contains_key(identity) {
            return false;
        }
        let _ = self.seen.insert(identity.to_string(), now);
        self.order.push_back((now, identity.to_string()));
        true
    }

    /// Number of identities currently remembered.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        while let Some((recorded, _)) = self.order.front() {
            if now.duration_since(*recorded) < self.window {
                break;
            }
            if let Some((recorded, id)) = self.order.pop_front() {
                if self.seen.get(&id) == Some(&recorded) {
                    let _ = self.seen.remove(&id);
                }
            }
        }
    }
}
