//! Backend drivers producing raw change events.
//!
//! Each driver runs on the session's dedicated thread and feeds an
//! [`EventPipeline`], which filters, debounces and dispatches on that same
//! thread. Drivers return when the stop flag is raised or when they hit an
//! unrecoverable error.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering::Acquire},
    },
    time::{Duration, Instant},
};

use tracing::warn;

use crate::{
    error::DriverError,
    watcher::{
        debouncer::Debouncer,
        dispatch::Dispatcher,
        events::{Backend, WatchEvent},
        filter::PathFilter,
        session::SessionState,
    },
};

pub mod polling;
pub mod privileged;
pub mod userspace;

pub use {polling::PollingDriver, privileged::PrivilegedDriver, userspace::UserSpaceDriver};

/// How often drivers wake up to check the stop flag and flush the debouncer.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// A directory resolved for watching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRoot {
    /// Canonical absolute path.
    pub path: PathBuf,
    pub recursive: bool,
}

/// The committed backend of a session, ready to run.
pub enum Driver {
    Privileged(PrivilegedDriver),
    UserSpace(UserSpaceDriver),
    Polling(PollingDriver),
}

impl Driver {
    pub fn backend(&self) -> Backend {
        match self {
            Self::Privileged(_) => Backend::Privileged,
            Self::UserSpace(_) => Backend::UserSpace,
            Self::Polling(_) => Backend::Polling,
        }
    }

    /// Number of roots the driver actually watches.
    pub fn roots_watched(&self) -> usize {
        match self {
            Self::Privileged(driver) => driver.roots_watched(),
            Self::UserSpace(driver) => driver.roots_watched(),
            Self::Polling(driver) => driver.roots_watched(),
        }
    }

    /// Runs the driver loop until stopped or failed.
    ///
    /// # Errors
    ///
    /// Returns `DriverError` if the backend cannot continue.
    pub fn run(self, context: &mut DriverContext) -> Result<(), DriverError> {
        match self {
            Self::Privileged(driver) => driver.run(context),
            Self::UserSpace(driver) => driver.run(context),
            Self::Polling(driver) => driver.run(context),
        }
    }
}

/// Filter, debouncer and dispatcher chained on the driver thread.
pub struct EventPipeline {
    filter: PathFilter,
    debouncer: Debouncer,
    dispatcher: Dispatcher,
    session: Arc<SessionState>,
    ready: Vec<WatchEvent>,
}

impl EventPipeline {
    pub fn new(
        filter: PathFilter,
        debouncer: Debouncer,
        dispatcher: Dispatcher,
        session: Arc<SessionState>,
    ) -> Self {
        Self {
            filter,
            debouncer,
            dispatcher,
            session,
            ready: Vec::new(),
        }
    }

    /// Feeds one raw event from a driver.
    pub fn submit(&mut self, event: WatchEvent) {
        if !self.filter.allows(event.path()) {
            return;
        }
        if self.debouncer.accept(event, Instant::now(), &mut self.ready) {
            self.session.record_suppressed();
        }
        self.deliver();
    }

    /// Emits held events whose debounce window has closed.
    pub fn tick(&mut self) {
        self.debouncer.flush_expired(Instant::now(), &mut self.ready);
        self.deliver();
    }

    /// Emits everything still held. Called once when the driver returns.
    pub fn finish(&mut self) {
        self.debouncer.drain(&mut self.ready);
        self.deliver();
    }

    fn deliver(&mut self) {
        for event in self.ready.drain(..) {
            self.dispatcher.dispatch(&event);
        }
    }
}

/// Consecutive transient error tracking.
///
/// A success resets the count; exceeding the limit turns the last error
/// into a fatal one.
#[derive(Debug)]
pub struct ErrorBudget {
    limit: u32,
    consecutive: u32,
}

impl ErrorBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            consecutive: 0,
        }
    }

    pub fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Records a transient error, logging it at WARN.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::TooManyErrors` once the limit is reached.
    pub fn failure(&mut self, backend: Backend, error: impl ToString) -> Result<(), DriverError> {
        let error = error.to_string();
        self.consecutive += 1;
        warn!(
            backend = %backend,
            consecutive = self.consecutive,
            "Transient driver error: {}",
            error
        );
        if self.consecutive >= self.limit {
            return Err(DriverError::TooManyErrors {
                count: self.consecutive,
                last: error,
            });
        }
        Ok(())
    }
}

/// Everything a running driver needs from its session.
pub struct DriverContext {
    pub pipeline: EventPipeline,
    pub errors: ErrorBudget,
    stop: Arc<AtomicBool>,
}

impl DriverContext {
    pub fn new(pipeline: EventPipeline, errors: ErrorBudget, stop: Arc<AtomicBool>) -> Self {
        Self {
            pipeline,
            errors,
            stop,
        }
    }

    /// Whether the lifecycle controller asked the driver to return.
    pub fn should_stop(&self) -> bool {
        self.stop.load(Acquire)
    }

    /// Sleeps for `duration` in tick-sized slices, flushing the debouncer
    /// and returning early when stopped.
    ///
    /// # Returns
    ///
    /// `false` if the driver should stop.
    pub fn sleep(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            self.pipeline.tick();
            if self.should_stop() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(TICK_INTERVAL.min(deadline - now));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::{Arc, atomic::AtomicBool},
        time::Duration,
    };

    use crate::{
        error::DriverError,
        watcher::{
            debouncer::Debouncer,
            dispatch::{CallbackRegistry, Dispatcher, SubscriberSet},
            drivers::{DriverContext, ErrorBudget, EventPipeline},
            events::Backend,
            filter::PathFilter,
            session::SessionState,
        },
    };

    /// Context with no filtering or debouncing, feeding `subscribers`.
    pub(crate) fn driver_context(
        session: &Arc<SessionState>,
        subscribers: &Arc<SubscriberSet>,
        max_errors: u32,
    ) -> DriverContext {
        let dispatcher = Dispatcher::new(
            Arc::new(CallbackRegistry::default()),
            subscribers.clone(),
            session.clone(),
        );
        DriverContext::new(
            EventPipeline::new(
                PathFilter::default(),
                Debouncer::new(Duration::ZERO),
                dispatcher,
                session.clone(),
            ),
            ErrorBudget::new(max_errors),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_error_budget_promotes_after_limit() {
        let mut budget = ErrorBudget::new(3);
        assert!(budget.failure(Backend::Polling, "stat failed").is_ok());
        assert!(budget.failure(Backend::Polling, "stat failed").is_ok());
        assert!(matches!(
            budget.failure(Backend::Polling, "stat failed"),
            Err(DriverError::TooManyErrors { count: 3, .. })
        ));
    }

    #[test]
    fn test_error_budget_resets_on_success() {
        let mut budget = ErrorBudget::new(2);
        assert!(budget.failure(Backend::UserSpace, "x").is_ok());
        budget.success();
        assert!(budget.failure(Backend::UserSpace, "x").is_ok());
    }
}
