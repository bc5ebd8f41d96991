//! # eventgate-settings
//!
//! Layered configuration for the gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`GatewaySettings::default()`]
//! 2. **Settings file**: `~/.eventgate/settings.json` or an explicit path,
//!    deep-merged over defaults
//! 3. **Environment variables**: `EVENTGATE_*` overrides
//!
//! The loaded value is passed explicitly to the components that need it;
//! there is no process-wide settings global.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
