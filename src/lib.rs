//! fswatch-engine - Multi-backend file system change notification
//!
//! Watches directory trees and delivers normalized change events to
//! synchronous callbacks and bounded async queues. A session runs on the
//! best available backend: the privileged kernel-level facility when
//! enabled and permitted, the user-space watcher library otherwise, and
//! periodic polling as the fallback that always works. Bursts of events on
//! the same path are debounced before delivery.

pub mod config;
pub mod error;
pub mod watcher;

// Re-export key types for convenience
pub use {
    config::{SettingsError, WatchConfig},
    error::{DriverError, ErrorReporter, ResultExt, WatchError},
    watcher::{
        AsyncEventSource, Backend, CallbackHandle, CapabilityProbe, EventKind, EventTimestamp,
        FileWatcher, SessionPhase, SystemProbe, WatchEvent, WatchStatistics,
    },
};
