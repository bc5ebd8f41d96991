//! Event types, subscription conditions and the bus event envelope.
//!
//! Event types are dot-namespaced (`chat.message`, `system.ping`). The final
//! segment may be the wildcard `*`, in which case the type matches every
//! event under the same prefix (`chat.*` matches `chat.message` and
//! `chat.join` but not `system.ping`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ProtocolError;

/// Wildcard segment accepted at the end of an event type.
pub const WILDCARD: &str = "*";

/// Prefix shared by every dispatch channel on the bus.
pub const DISPATCH_CHANNEL_PREFIX: &str = "events:dispatch:";

/// Key/value constraints narrowing a subscription.
///
/// A `BTreeMap` keeps iteration order stable so two equal conditions always
/// compare and hash the same way.
pub type Condition = BTreeMap<String, String>;

/// Bus channel name for an event type: `events:dispatch:<type>`.
pub fn channel_for(event_type: &EventType) -> String {
    format!("{DISPATCH_CHANNEL_PREFIX}{}", event_type.0)
}

/// Validated, dot-namespaced event type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventType(String);

impl EventType {
    /// Parse and validate an event type.
    ///
    /// At least two segments of `[A-Za-z0-9_-]`; only the last segment may be `*`.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() < 2 {
            return Err(ProtocolError::InvalidEventType(raw.to_string()));
        }
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            let ok = if i == last && *segment == WILDCARD {
                true
            } else {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            };
            if !ok {
                return Err(ProtocolError::InvalidEventType(raw.to_string()));
            }
        }
        Ok(Self(raw.to_string()))
    }

    /// The type as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the final segment is the wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.0.ends_with(".*")
    }

    /// Everything before the final segment (`chat` for `chat.message`).
    pub fn namespace(&self) -> &str {
        self.0.rsplit_once('.').map_or(self.0.as_str(), |(ns, _)| ns)
    }

    /// Whether an incoming concrete event type is covered by this type.
    pub fn matches(&self, event: &EventType) -> bool {
        if self.is_wildcard() {
            let prefix = &self.0[..self.0.len() - 1];
            event.0.starts_with(prefix)
        } else {
            self.0 == event.0
        }
    }

    /// The wildcard type for this type's namespace (`chat.*` for `chat.message`).
    pub fn wildcard(&self) -> EventType {
        EventType(format!("{}.{WILDCARD}", self.namespace()))
    }

    /// The bus channel carrying events of exactly this type.
    pub fn channel(&self) -> String {
        channel_for(self)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EventType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// An application event as published on the bus.
///
/// Publishers send one of these to the exact channel for its type and to
/// each enclosing wildcard channel; see [`BusEvent::channels`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    /// Type of the event, normally concrete.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Attributes matched against subscription conditions.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Opaque body forwarded to clients.
    #[serde(default)]
    pub body: serde_json::Value,
    /// Optional publisher-supplied content hash used for de-duplication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl BusEvent {
    /// Create an event with no attributes.
    pub fn new(event_type: EventType, body: serde_json::Value) -> Self {
        Self {
            event_type,
            attributes: BTreeMap::new(),
            body,
            hash: None,
        }
    }

    /// Add an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.attributes.insert(key.into(), value.into());
        self
    }

    /// Channels this event should be published to.
    ///
    /// The exact channel first, then one wildcard channel per enclosing
    /// namespace (`a.b.*`, then `a.*` for `a.b.c`), so every wildcard
    /// subscription whose prefix covers the type receives it. A wildcard
    /// type is its own first enclosing channel and is listed once.
    pub fn channels(&self) -> Vec<String> {
        let mut channels = vec![self.event_type.channel()];
        let mut prefix = if self.event_type.is_wildcard() {
            self.event_type.namespace()
        } else {
            self.event_type.as_str()
        };
        while let Some((ns, _)) = prefix.rsplit_once('.') {
            channels.push(format!("{DISPATCH_CHANNEL_PREFIX}{ns}.{WILDCARD}"));
            prefix = ns;
        }
        channels
    }
}
