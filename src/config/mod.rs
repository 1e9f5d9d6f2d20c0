//! Watch session configuration.
//!
//! This module provides the serde-backed `WatchConfig` together with
//! validation and XDG-compliant persistence helpers.

pub mod settings;

pub use settings::{SettingsError, WatchConfig, get_config_path};
