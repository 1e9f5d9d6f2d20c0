//! Watch configuration with XDG Base Directory compliance.
//!
//! `WatchConfig` is the input contract of a watch session. It is normally
//! supplied by the embedding application, but can also be persisted as JSON
//! under the user's config directory.

use std::{
    env::var,
    fs::{create_dir_all, read_to_string, write},
    io::Error as StdError,
    path::{Path, PathBuf},
    time::Duration,
};

use {
    serde::{Deserialize, Serialize},
    serde_json::{Error as SerdeJsonError, from_str, to_string_pretty},
    thiserror::Error,
    tracing::debug,
};

/// Default debounce window in seconds.
pub const DEFAULT_THROTTLE_WINDOW_SECONDS: f64 = 1.0;

/// Default capacity of each async event queue.
pub const DEFAULT_ASYNC_QUEUE_CAPACITY: usize = 1000;

/// Default cadence of the polling driver in seconds.
pub const DEFAULT_POLL_INTERVAL_SECONDS: f64 = 2.0;

/// Default number of consecutive transient errors tolerated by a driver.
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Error type for settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Failed to read or write settings file.
    #[error("IO error: {0}")]
    IoError(#[from] StdError),
    /// Failed to serialize or deserialize settings.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] SerdeJsonError),
    /// Invalid settings value.
    #[error("Invalid settings value: {reason}")]
    InvalidValue { reason: String },
}

impl SettingsError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            reason: reason.into(),
        }
    }
}

/// Configuration of a single watch session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Directories to watch, in priority order. Duplicates are ignored.
    pub paths: Vec<PathBuf>,
    /// Whether subdirectories of each path are watched too.
    pub recursive: bool,
    /// Opt-in for the kernel-level backend (still requires root at runtime).
    pub enable_privileged_backend: bool,
    /// Debounce window in seconds; `0` disables debouncing.
    pub throttle_window_seconds: f64,
    /// Default capacity of async event queues.
    pub async_queue_capacity: usize,
    /// Interval between full directory walks of the polling driver.
    pub poll_interval_seconds: f64,
    /// Consecutive transient errors before a driver gives up.
    pub max_consecutive_errors: u32,
    /// Whether events on hidden entries are reported. An entry is hidden if
    /// its name, or any directory between it and the watched root, starts
    /// with a dot; the root's own path is not considered.
    pub include_hidden: bool,
    /// Regular expressions matched against full paths; matches are dropped.
    pub exclude_patterns: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            paths: vec![],
            recursive: true,
            enable_privileged_backend: false,
            throttle_window_seconds: DEFAULT_THROTTLE_WINDOW_SECONDS,
            async_queue_capacity: DEFAULT_ASYNC_QUEUE_CAPACITY,
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            include_hidden: true,
            exclude_patterns: vec![],
        }
    }
}

impl WatchConfig {
    /// Creates a configuration watching the given paths with defaults otherwise.
    pub fn with_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Checks the numeric and structural invariants of the configuration.
    ///
    /// Path existence is not checked here: missing paths are skipped with a
    /// warning when the session starts.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::InvalidValue` describing the first violated rule.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.paths.is_empty() {
            return Err(SettingsError::invalid("paths must not be empty"));
        }
        if let Some(relative) = self.paths.iter().find(|p| !p.is_absolute()) {
            return Err(SettingsError::invalid(format!(
                "path {} is not absolute",
                relative.display()
            )));
        }
        if !self.throttle_window_seconds.is_finite() || self.throttle_window_seconds < 0.0 {
            return Err(SettingsError::invalid(
                "throttle_window_seconds must be a finite value >= 0",
            ));
        }
        if !self.poll_interval_seconds.is_finite() || self.poll_interval_seconds <= 0.0 {
            return Err(SettingsError::invalid(
                "poll_interval_seconds must be a finite value > 0",
            ));
        }
        if self.async_queue_capacity == 0 {
            return Err(SettingsError::invalid("async_queue_capacity must be >= 1"));
        }
        if self.max_consecutive_errors == 0 {
            return Err(SettingsError::invalid("max_consecutive_errors must be >= 1"));
        }
        Ok(())
    }

    /// Debounce window as a `Duration`.
    #[must_use]
    pub fn throttle_window(&self) -> Duration {
        Duration::from_secs_f64(self.throttle_window_seconds.max(0.0))
    }

    /// Polling cadence as a `Duration`.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds.max(0.0))
    }

    /// Loads a configuration from a JSON file.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        debug!("Loading watch configuration from {:?}", path);
        let contents = read_to_string(path)?;
        Ok(from_str(&contents)?)
    }

    /// Saves the configuration as pretty-printed JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        debug!("Saving watch configuration to {:?}", path);
        write(path, to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Ensures proper XDG directory usage for the config file.
///
/// # Returns
///
/// The path to the default configuration file.
#[must_use]
pub fn get_config_path() -> PathBuf {
    let mut config_dir = get_xdg_config_home();
    config_dir.push("fswatch-engine");
    config_dir.push("watch.json");
    config_dir
}

/// Gets the XDG config home directory following XDG Base Directory specification.
///
/// Uses `XDG_CONFIG_HOME` environment variable if set, otherwise defaults to $HOME/.config
fn get_xdg_config_home() -> PathBuf {
    if let Ok(config_home) = var("XDG_CONFIG_HOME")
        && !config_home.is_empty()
    {
        return PathBuf::from(config_home);
    }

    if let Ok(home) = var("HOME") {
        let mut path = PathBuf::from(home);
        path.push(".config");
        return path;
    }

    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use {serde_json::from_str, tempfile::TempDir};

    use crate::config::settings::{SettingsError, WatchConfig};

    #[test]
    fn test_watch_config_default() {
        let config = WatchConfig::default();
        assert!(config.recursive);
        assert!(!config.enable_privileged_backend);
        assert_eq!(config.throttle_window(), Duration::from_secs(1));
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.async_queue_capacity, 1000);
        assert!(config.include_hidden);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(WatchConfig::default().validate().is_err());

        let relative = WatchConfig::with_paths(["relative/dir"]);
        assert!(matches!(
            relative.validate(),
            Err(SettingsError::InvalidValue { .. })
        ));

        let mut negative = WatchConfig::with_paths(["/tmp"]);
        negative.throttle_window_seconds = -1.0;
        assert!(negative.validate().is_err());

        let mut zero_poll = WatchConfig::with_paths(["/tmp"]);
        zero_poll.poll_interval_seconds = 0.0;
        assert!(zero_poll.validate().is_err());

        let mut zero_capacity = WatchConfig::with_paths(["/tmp"]);
        zero_capacity.async_queue_capacity = 0;
        assert!(zero_capacity.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_zero_throttle() {
        let mut config = WatchConfig::with_paths(["/tmp"]);
        config.throttle_window_seconds = 0.0;
        assert!(config.validate().is_ok());
        assert_eq!(config.throttle_window(), Duration::ZERO);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: WatchConfig =
            from_str(r#"{"paths": ["/srv/data"], "throttle_window_seconds": 0.25}"#).unwrap();
        assert_eq!(config.paths, vec![PathBuf::from("/srv/data")]);
        assert_eq!(config.throttle_window(), Duration::from_millis(250));
        assert_eq!(config.async_queue_capacity, 1000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("watch.json");

        let mut config = WatchConfig::with_paths([dir.path()]);
        config.exclude_patterns = vec![r"\.swp$".to_string()];
        config.save(&path).unwrap();

        assert_eq!(WatchConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_settings_error_display() {
        let error = SettingsError::InvalidValue {
            reason: "test reason".to_string(),
        };
        assert_eq!(error.to_string(), "Invalid settings value: test reason");
    }
}
