//! # kgate-settings
//!
//! Configuration for kgate, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`KgateSettings::default()`]
//! 2. **User file**: `~/.kgate/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `KGATE_*` overrides
//!
//! There is no global instance. Binaries load once and pass the value to
//! the components that need it.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_file, load_settings,
    load_settings_from_path, settings_path,
};
pub use types::{BasicAuth, GatewaySettings, KernelSettings, KgateSettings, LoggingSettings};
