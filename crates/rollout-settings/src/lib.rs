//! # rollout-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** - [`Settings::default()`]
//! 2. **Settings file** - `~/.rollout/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables** - `PORT` and `ROLLOUT_*` overrides
//!
//! The loaded value is passed explicitly to whatever needs it; the service
//! mapping is read once at startup and never reloaded.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_env_overrides_from, deep_merge,
    load_settings_from_path, settings_path,
};
pub use types::*;
