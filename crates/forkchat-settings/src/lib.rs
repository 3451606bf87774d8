//! # forkchat-settings
//!
//! Layered configuration for forkchat:
//! 1. Compiled defaults ([`ForkchatSettings::default()`])
//! 2. `~/.forkchat/settings.json`, deep-merged over the defaults
//! 3. `FORKCHAT_*` environment variables
//!
//! ```no_run
//! let settings = forkchat_settings::load_settings().unwrap_or_default();
//! println!("preview: {} chars", settings.tree.preview_chars);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, expand_home, forkchat_home,
    load_settings, load_settings_from_path, parse_bool, settings_path,
};
pub use types::*;
