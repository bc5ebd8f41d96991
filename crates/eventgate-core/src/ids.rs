//! Session identifiers.
//!
//! A session id is 16 bytes from the operating system RNG, hex-encoded. It is
//! sent to the client in the `Hello` payload and used as the connection's log
//! key.

use std::fmt;

use rand::TryRngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::{GatewayError, Result};

/// Number of random bytes in a session id.
pub const SESSION_ID_BYTES: usize = 16;

/// Hex-encoded random session identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new session id from the OS random source.
    ///
    /// Fails only when the OS RNG is unavailable, which is a setup error for
    /// the connection being created.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(GatewayError::setup)?;
        Ok(Self(hex::encode(bytes)))
    }

    /// Return the inner string as a slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
