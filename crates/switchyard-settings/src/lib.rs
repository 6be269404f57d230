//! # switchyard-settings
//!
//! Layered configuration for the Switchyard gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`GatewaySettings::default()`]
//! 2. **Settings file**: `~/.switchyard/settings.json` or an explicit path,
//!    deep-merged over the defaults
//! 3. **Environment variables**: `MCP_SSE_PORT`, `MCP_TIMEOUT`, `SSE_TIMEOUT`,
//!    `CORS_ALLOW_ORIGIN`, `LOG_LEVEL`, `LOG_FORMAT` and `SWITCHYARD_*`
//!
//! Command-line flags are layered on top by the binary.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    RejectedOverride, deep_merge, load_settings, load_settings_from_path, load_settings_with,
    load_settings_with_report, settings_path,
};
pub use types::*;
