//! # kvbridge-settings
//!
//! Configuration for the bridge, loaded in three layers (lowest first):
//! 1. **Compiled defaults**: [`BridgeSettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over the defaults
//! 3. **Environment variables**: `KVBRIDGE_*` overrides

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
