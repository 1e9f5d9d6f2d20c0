//! Error handling using `thiserror` and `anyhow`.
//!
//! Domain errors are typed so callers can match on them; operational
//! errors carry `anyhow` context and are reported through `tracing`.

pub mod domain;
pub mod operational;

pub use {
    domain::{DriverError, WatchError},
    operational::{ErrorReporter, ResultExt},
};
