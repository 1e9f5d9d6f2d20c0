//! Domain-specific error types using `thiserror`.
//!
//! This module defines the error enums surfaced by the watcher facade
//! and the ones recorded internally when a backend driver gives up.

use std::{io::Error as IoError, time::Duration};

use {notify::Error as NotifyError, regex::Error as RegexError, thiserror::Error};

use crate::config::SettingsError;

/// Errors returned to callers of the watcher facade.
#[derive(Error, Debug)]
pub enum WatchError {
    /// A session is already initializing or watching.
    #[error("A watch session is already running")]
    AlreadyWatching,
    /// The supplied configuration failed validation.
    #[error("Invalid configuration: {0}")]
    Config(#[from] SettingsError),
    /// None of the configured paths exist or are directories.
    #[error("No valid paths to watch")]
    NoValidPaths,
    /// An exclude pattern is not a valid regular expression.
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(#[from] RegexError),
    /// The driver thread could not be spawned.
    #[error("Failed to spawn driver thread: {0}")]
    Spawn(#[source] IoError),
    /// The driver did not shut down within the allotted time.
    #[error("Driver did not stop within {timeout:?}")]
    StopTimeout { timeout: Duration },
}

/// Errors raised by backend drivers.
///
/// These never reach the caller through `Result`: probing failures make the
/// selector fall through, and failures of a running driver end the session
/// and are reported through the statistics snapshot.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The backend cannot be used in this environment.
    #[error("Backend unavailable: {reason}")]
    Unavailable { reason: String },
    /// An operating system call failed.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),
    /// The user-space watcher library reported an error.
    #[error("Watcher library error: {0}")]
    Notify(#[from] NotifyError),
    /// Transient errors exceeded the configured threshold.
    #[error("Giving up after {count} consecutive errors (last: {last})")]
    TooManyErrors { count: u32, last: String },
    /// The watcher library's dispatch thread went away.
    #[error("Watcher library thread terminated unexpectedly")]
    WatcherThreadDied,
    /// The driver loop panicked.
    #[error("Driver panicked: {0}")]
    Panicked(String),
}

impl DriverError {
    /// Creates a new `Unavailable` error.
    ///
    /// # Arguments
    ///
    /// * `reason` - Why the backend cannot be used.
    ///
    /// # Returns
    ///
    /// A new `DriverError::Unavailable`.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}
