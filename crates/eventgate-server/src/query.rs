//! Subscription list carried in a push-only connection URI.
//!
//! SSE clients cannot send frames, so their subscriptions travel in the path
//! suffix after the endpoint: `@chat.message<room=1;lang=en>,system.*`.
//! The suffix may be percent-encoded.

use std::sync::LazyLock;

use eventgate_core::protocol::SubscribePayload;
use regex::Regex;
use tracing::{debug, warn};

static ITEM_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<evt>\w+(?:\.[\w-]+)*\.[A-Za-z0-9_*-]+)(?:<(?P<cnd>.+)>)?$").unwrap()
});

/// Parse the subscription suffix of a push-only URI.
///
/// Returns an empty list when the suffix is not `@`-prefixed or cannot be
/// decoded. Malformed items and malformed `key=value` pairs are skipped.
pub fn parse_subscriptions(suffix: &str) -> Vec<SubscribePayload> {
    let decoded = match urlencoding::decode(suffix) {
        Ok(decoded) => decoded,
        Err(error) => {
            warn!(%error, "subscription suffix is not valid utf-8");
            return Vec::new();
        }
    };
    let Some(list) = decoded.strip_prefix('@') else {
        return Vec::new();
    };

    let mut subscriptions = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some(caps) = ITEM_PATTERN.captures(item) else {
            debug!(item, "skipping malformed subscription item");
            continue;
        };
        let mut payload = SubscribePayload::new(&caps["evt"]);
        if let Some(condition) = caps.name("cnd") {
            for pair in condition.as_str().split(';') {
                let parts: Vec<&str> = pair.split('=').collect();
                if let [key, value] = parts.as_slice() {
                    if !key.is_empty() {
                        payload = payload.with_condition(*key, *value);
                    }
                } else {
                    debug!(pair, "skipping malformed condition pair");
                }
            }
        }
        subscriptions.push(payload);
    }
    subscriptions
}
