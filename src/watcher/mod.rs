//! Multi-backend file system change notification.
//!
//! This module provides the `FileWatcher` facade, which owns the lifecycle
//! of watch sessions: it selects a backend, runs it on a dedicated thread,
//! debounces what it reports and fans events out to synchronous callbacks
//! and async queues.

use std::{
    collections::{BTreeMap, HashSet},
    fs::canonicalize,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{
            AtomicBool, AtomicUsize,
            Ordering::{Relaxed, Release},
        },
    },
    thread::{Builder, JoinHandle, sleep},
    time::{Duration, Instant},
};

use {
    parking_lot::{Mutex, RwLock},
    tracing::{debug, error, info, warn},
};

use crate::{
    config::{WatchConfig, settings::DEFAULT_ASYNC_QUEUE_CAPACITY},
    error::{DriverError, ErrorReporter, WatchError},
};

pub mod debouncer;
pub mod dispatch;
pub mod drivers;
pub mod events;
pub mod filter;
pub mod selector;
pub mod session;


pub use {
    dispatch::{AsyncEventSource, CallbackHandle},
    events::{Backend, EventKind, EventTimestamp, WatchEvent},
    selector::{CapabilityProbe, SystemProbe},
    session::{SessionPhase, WatchStatistics},
};

use {
    debouncer::Debouncer,
    dispatch::{CallbackRegistry, Dispatcher, SubscriberSet, panic_message},
    drivers::{Driver, DriverContext, ErrorBudget, EventPipeline, WatchRoot},
    filter::{PathFilter, normalize_path},
    selector::BackendSelector,
    session::SessionState,
};

/// Timeout used when a watcher is dropped while still running.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Control handles of the current or last session.
struct RunningSession {
    state: Arc<SessionState>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Watches directories for changes and delivers normalized events.
///
/// Each instance owns at most one session at a time. Sessions are started
/// with [`start`](Self::start) and ended with [`stop`](Self::stop); the
/// backend is chosen once per session and never swapped while it runs.
/// Independent instances do not share any state.
pub struct FileWatcher {
    /// Environment capability checks for backend selection.
    probe: Arc<dyn CapabilityProbe>,
    /// Synchronous consumers, kept across sessions.
    callbacks: Arc<CallbackRegistry>,
    /// Async subscriptions of the current or next session. Swapped for a
    /// fresh set when a session is detached.
    subscribers: Mutex<Arc<SubscriberSet>>,
    /// Capacity used when `enable_async(0)` is called.
    default_capacity: AtomicUsize,
    /// Start/stop serialization point.
    control: Mutex<Option<RunningSession>>,
    /// State of the current or last session, read by statistics.
    session: RwLock<Arc<SessionState>>,
    /// Events per backend from sessions before the current one.
    backend_totals: Mutex<BTreeMap<Backend, u64>>,
}

impl FileWatcher {
    /// Creates a watcher that probes the real environment.
    pub fn new() -> Self {
        Self::with_probe(Arc::new(SystemProbe))
    }

    /// Creates a watcher with a custom capability probe.
    ///
    /// # Arguments
    ///
    /// * `probe` - Answers the selector's capability questions.
    pub fn with_probe(probe: Arc<dyn CapabilityProbe>) -> Self {
        Self {
            probe,
            callbacks: Arc::new(CallbackRegistry::default()),
            subscribers: Mutex::new(Arc::new(SubscriberSet::default())),
            default_capacity: AtomicUsize::new(DEFAULT_ASYNC_QUEUE_CAPACITY),
            control: Mutex::new(None),
            session: RwLock::new(Arc::new(SessionState::default())),
            backend_totals: Mutex::new(BTreeMap::new()),
        }
    }

    /// Starts a watch session.
    ///
    /// Paths that do not exist or are not directories are skipped with a
    /// warning. The first backend passing its capability probe is committed
    /// for the session.
    ///
    /// # Arguments
    ///
    /// * `config` - Session configuration.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::AlreadyWatching` if a session is running,
    /// `WatchError::Config` or `WatchError::InvalidPattern` for invalid
    /// configuration, `WatchError::NoValidPaths` if no path can be watched,
    /// and `WatchError::Spawn` if the driver thread cannot be created.
    pub fn start(&self, config: WatchConfig) -> Result<(), WatchError> {
        let mut control = self.control.lock();
        if let Some(running) = control.as_ref()
            && running.state.phase() != SessionPhase::Stopped
        {
            return Err(WatchError::AlreadyWatching);
        }
        // The previous session ended on its own; its thread has returned or is about to.
        if let Some(finished) = control.take()
            && finished.handle.join().is_err()
        {
            error!("Previous driver thread panicked");
        }

        config.validate()?;
        let filter = PathFilter::from_config(&config)?;

        let state = Arc::new(SessionState::initializing());
        self.replace_session(state.clone());

        let roots = resolve_roots(&config);
        if roots.is_empty() {
            state.mark_stopped();
            return Err(WatchError::NoValidPaths);
        }
        let filter = filter.with_roots(roots.iter().map(|root| root.path.clone()));

        let driver = BackendSelector::new(self.probe.as_ref()).select(
            &roots,
            config.enable_privileged_backend,
            config.poll_interval(),
        );
        let backend = driver.backend();
        self.default_capacity
            .store(config.async_queue_capacity, Relaxed);

        let subscribers = self.subscribers.lock().clone();
        let stop = Arc::new(AtomicBool::new(false));
        let pipeline = EventPipeline::new(
            filter,
            Debouncer::new(config.throttle_window()),
            Dispatcher::new(self.callbacks.clone(), subscribers.clone(), state.clone()),
            state.clone(),
        );
        let context = DriverContext::new(
            pipeline,
            ErrorBudget::new(config.max_consecutive_errors),
            stop.clone(),
        );

        state.begin_watching(backend, driver.roots_watched());
        info!(
            backend = %backend,
            paths = driver.roots_watched(),
            throttle = ?config.throttle_window(),
            "Watch session started"
        );

        let thread_state = state.clone();
        let handle = Builder::new()
            .name(format!("fswatch-{backend}"))
            .spawn(move || run_session(driver, context, thread_state, subscribers))
            .map_err(|e| {
                state.mark_stopped();
                WatchError::Spawn(e)
            })?;

        *control = Some(RunningSession {
            state,
            stop,
            handle,
        });
        Ok(())
    }

    /// Stops the current session.
    ///
    /// Signals the driver, waits for its thread up to `timeout` and closes
    /// async sources so consumers see end-of-stream. Calling this without a
    /// running session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::StopTimeout` if the driver thread did not exit
    /// in time. The session is still marked stopped and its thread detached;
    /// anything it produces afterwards is discarded.
    pub fn stop(&self, timeout: Duration) -> Result<(), WatchError> {
        let mut control = self.control.lock();
        let Some(running) = control.take() else {
            return Ok(());
        };

        running.state.transition(SessionPhase::Stopping);
        running.stop.store(true, Release);

        let deadline = Instant::now() + timeout;
        while !running.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("Driver did not stop within {:?}; detaching it", timeout);
                running.state.detach();
                let detached = std::mem::replace(
                    &mut *self.subscribers.lock(),
                    Arc::new(SubscriberSet::default()),
                );
                detached.retire();
                running.state.mark_stopped();
                return Err(WatchError::StopTimeout { timeout });
            }
            sleep(Duration::from_millis(5));
        }

        if running.handle.join().is_err() {
            error!("Driver thread panicked during shutdown");
        }
        running.state.mark_stopped();
        debug!("Watch session stopped");
        Ok(())
    }

    /// Registers a synchronous consumer.
    ///
    /// Callbacks run on the driver thread, strictly in registration order,
    /// for every session of this watcher. Errors and panics are logged and
    /// counted; they never interrupt delivery.
    pub fn register_callback<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&WatchEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.register(callback)
    }

    /// Removes a synchronous consumer.
    ///
    /// # Returns
    ///
    /// `true` if the callback was registered.
    pub fn unregister_callback(&self, handle: CallbackHandle) -> bool {
        self.callbacks.unregister(handle)
    }

    /// Creates an async event source.
    ///
    /// The source receives events dispatched from now on, until the current
    /// session ends; created while no session runs, it attaches to the next
    /// one. When full, the oldest queued event is dropped and counted.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Queue bound; `0` uses the session's `async_queue_capacity`.
    pub fn enable_async(&self, capacity: usize) -> AsyncEventSource {
        let capacity = if capacity == 0 {
            self.default_capacity.load(Relaxed)
        } else {
            capacity
        };
        self.subscribers.lock().subscribe(capacity)
    }

    /// Point-in-time statistics of the current or last session.
    pub fn get_statistics(&self) -> WatchStatistics {
        let session = self.session.read().clone();
        session.snapshot(&self.backend_totals.lock())
    }

    /// Recently dispatched events of the current or last session, oldest first.
    pub fn recent_events(&self) -> Vec<WatchEvent> {
        self.session.read().recent_events()
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.read().phase()
    }

    pub fn is_watching(&self) -> bool {
        self.phase() == SessionPhase::Watching
    }

    /// Installs a new session, folding the previous one into the per-backend totals.
    fn replace_session(&self, state: Arc<SessionState>) {
        let previous = std::mem::replace(&mut *self.session.write(), state);
        if let Some(backend) = previous.backend() {
            *self.backend_totals.lock().entry(backend).or_default() +=
                previous.events_processed();
        }
    }
}

impl Default for FileWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        if let Err(e) = self.stop(DEFAULT_STOP_TIMEOUT) {
            warn!("Failed to stop watcher on drop: {}", e);
        }
    }
}

/// Body of the driver thread.
fn run_session(
    driver: Driver,
    mut context: DriverContext,
    state: Arc<SessionState>,
    subscribers: Arc<SubscriberSet>,
) {
    let backend = driver.backend();
    let result = catch_unwind(AssertUnwindSafe(|| driver.run(&mut context)))
        .unwrap_or_else(|panic| Err(DriverError::Panicked(panic_message(panic.as_ref()))));

    context.pipeline.finish();

    match result {
        Ok(()) => debug!(backend = %backend, "Driver returned"),
        Err(e) => {
            state.record_fatal(e.to_string());
            ErrorReporter::error(
                &anyhow::Error::new(e).context(format!("{backend} driver failed, ending session")),
                "driver thread",
            );
        }
    }

    subscribers.close_all();
    state.mark_stopped();
}

/// Canonicalizes the configured paths, skipping missing ones and duplicates.
fn resolve_roots(config: &WatchConfig) -> Vec<WatchRoot> {
    let mut seen = HashSet::new();
    let mut roots = Vec::new();

    for path in &config.paths {
        let canonical = match canonicalize(path) {
            Ok(canonical) => normalize_path(&canonical),
            Err(e) => {
                warn!("Skipping watch path {:?}: {}", path, e);
                continue;
            }
        };
        if !canonical.is_dir() {
            warn!("Skipping watch path {:?}: not a directory", path);
            continue;
        }
        if seen.insert(canonical.clone()) {
            roots.push(WatchRoot {
                path: canonical,
                recursive: config.recursive,
            });
        }
    }
    roots
}
