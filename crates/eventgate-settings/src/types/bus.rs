//! Pub/sub backend settings.

use serde::{Deserialize, Serialize};

/// Which message bus implementation to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// In-process bus; events only reach this process.
    #[default]
    Memory,
    /// Redis pub/sub.
    Redis,
}

impl BusBackend {
    /// Parse a backend name, case-insensitive.
    pub fn parse(val: &str) -> Option<Self> {
        match val.to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }
}

/// Pub/sub backend settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusSettings {
    /// Backend implementation.
    pub backend: BusBackend,
    /// Connection URL for the Redis backend.
    pub redis_url: String,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            backend: BusBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_backend() {
        assert_eq!(BusBackend::parse("Redis"), Some(BusBackend::Redis));
        assert_eq!(BusBackend::parse("memory"), Some(BusBackend::Memory));
        assert_eq!(BusBackend::parse("kafka"), None);
    }
}
