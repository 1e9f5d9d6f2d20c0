//! `anyhow`-based reporting for errors that are contained, not returned.
//!
//! Most failures inside a session never reach the caller: a backend that
//! cannot be used is skipped, a stale kernel handle is ignored, a callback
//! error is counted. They still go through [`ErrorReporter`] so the log
//! shows the whole cause chain with the component that absorbed it.

use std::{error::Error as StdError, fmt::Display};

use {
    anyhow::{Context, Error, Result as AnyhowResult},
    tracing::{debug, error, info, warn},
};

/// Attaches a description of the failed step to any `std` error.
pub trait ResultExt<T, E> {
    fn add_context(self, context: &'static str) -> AnyhowResult<T>
    where
        E: StdError + Send + Sync + 'static;

    /// Like [`add_context`](Self::add_context), but the message is only
    /// rendered on failure.
    fn add_contextf(self, format: impl Display) -> AnyhowResult<T>
    where
        E: StdError + Send + Sync + 'static;
}

impl<T, E> ResultExt<T, E> for Result<T, E> {
    fn add_context(self, context: &'static str) -> AnyhowResult<T>
    where
        E: StdError + Send + Sync + 'static,
    {
        self.context(context)
    }

    fn add_contextf(self, format: impl Display) -> AnyhowResult<T>
    where
        E: StdError + Send + Sync + 'static,
    {
        self.with_context(|| format.to_string())
    }
}

/// Logs contained errors with their full cause chain.
///
/// `component` names what absorbed the error, e.g. `"backend selection"`
/// or `"sync callback"`.
pub struct ErrorReporter;

impl ErrorReporter {
    /// Routine failures that are skipped without affecting delivery.
    pub fn debug(error: &Error, component: &str) {
        debug!(component, error = %format_args!("{error:#}"), "Ignored error");
    }

    /// Expected failures, such as a backend that is not available here.
    pub fn info(error: &Error, component: &str) {
        info!(component, error = %format_args!("{error:#}"), "Expected failure");
    }

    /// Degraded operation: a fallback was taken or an event may be lost.
    pub fn warn(error: &Error, component: &str) {
        warn!(component, error = %format_args!("{error:#}"), "Recoverable error");
    }

    /// The session or the program cannot continue.
    pub fn error(error: &Error, component: &str) {
        error!(component, error = %format_args!("{error:#}"), "Unrecoverable error");
    }

    /// Joins an error and its causes into one line for terminal output.
    pub fn to_user_message(error: &Error) -> String {
        error
            .chain()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": ")
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Error as IoError, ErrorKind::NotFound};

    use anyhow::anyhow;

    use crate::error::{
        DriverError,
        operational::{ErrorReporter, ResultExt},
    };

    #[test]
    fn test_add_context_keeps_source() {
        let result: Result<(), IoError> = Err(IoError::new(NotFound, "gone"));
        let error = result.add_context("Reading config").unwrap_err();
        assert_eq!(error.to_string(), "Reading config");
        assert_eq!(ErrorReporter::to_user_message(&error), "Reading config: gone");
    }

    #[test]
    fn test_add_contextf_formats_lazily() {
        let ok: Result<u8, IoError> = Ok(7);
        assert_eq!(ok.add_contextf("Loading watch.json").unwrap(), 7);

        let result: Result<(), IoError> = Err(IoError::new(NotFound, "gone"));
        let error = result.add_contextf(format!("Loading {}", "watch.json")).unwrap_err();
        assert_eq!(
            ErrorReporter::to_user_message(&error),
            "Loading watch.json: gone"
        );
    }

    #[test]
    fn test_driver_errors_report_at_every_level() {
        let error = anyhow::Error::new(DriverError::unavailable("process is not privileged"))
            .context("privileged backend not used");
        ErrorReporter::debug(&error, "privileged driver");
        ErrorReporter::info(&error, "backend selection");
        ErrorReporter::warn(&error, "backend selection");
        ErrorReporter::error(&error, "driver thread");

        assert_eq!(
            ErrorReporter::to_user_message(&error),
            "privileged backend not used: Backend unavailable: process is not privileged"
        );
    }

    #[test]
    fn test_user_message_without_causes() {
        assert_eq!(ErrorReporter::to_user_message(&anyhow!("No paths")), "No paths");
    }
}
