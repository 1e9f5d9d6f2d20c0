//! Session state machine and statistics.
//!
//! A `SessionState` exists per started session and is shared between the
//! lifecycle controller and the driver thread. Counters are atomics bumped
//! from the driver thread; everything else sits behind one mutex.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::atomic::{
        AtomicBool, AtomicU64,
        Ordering::{Acquire, Relaxed, Release},
    },
    time::Instant,
};

use {
    parking_lot::Mutex,
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::watcher::events::{Backend, WatchEvent};

/// Number of dispatched events retained for inspection.
pub const RECENT_EVENTS_CAPACITY: usize = 128;

/// Lifecycle phase of a watch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// No session has been started yet.
    #[default]
    Idle,
    /// Validating paths and selecting a backend.
    Initializing,
    /// A driver is running.
    Watching,
    /// `stop()` has been requested and the driver is shutting down.
    Stopping,
    /// The session ended, normally or after a fatal driver error.
    Stopped,
}

impl SessionPhase {
    fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::{Idle, Initializing, Stopped, Stopping, Watching};
        matches!(
            (self, next),
            (Idle | Stopped, Initializing)
                | (Initializing, Watching | Stopped)
                | (Watching, Stopping | Stopped)
                | (Stopping, Stopped)
        )
    }
}

/// Mutable state guarded by the session mutex.
#[derive(Debug, Default)]
struct SessionInner {
    phase: SessionPhase,
    backend: Option<Backend>,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
    paths_watched: usize,
    fatal_error: Option<String>,
    recent: VecDeque<WatchEvent>,
}

/// Shared state of one watch session.
#[derive(Debug, Default)]
pub struct SessionState {
    inner: Mutex<SessionInner>,
    events_processed: AtomicU64,
    drops: AtomicU64,
    suppressed: AtomicU64,
    callback_errors: AtomicU64,
    /// Set when `stop()` gave up waiting; the driver's output is discarded.
    detached: AtomicBool,
}

impl SessionState {
    /// Creates a session in the `Initializing` phase.
    pub fn initializing() -> Self {
        let state = Self::default();
        state.transition(SessionPhase::Initializing);
        state
    }

    /// Moves to `next` if the transition is legal.
    ///
    /// # Returns
    ///
    /// `true` if the phase changed.
    pub fn transition(&self, next: SessionPhase) -> bool {
        let mut inner = self.inner.lock();
        Self::transition_locked(&mut inner, next)
    }

    fn transition_locked(inner: &mut SessionInner, next: SessionPhase) -> bool {
        if !inner.phase.can_transition_to(next) {
            debug!("Ignoring session transition {:?} -> {:?}", inner.phase, next);
            return false;
        }
        debug!("Session transition {:?} -> {:?}", inner.phase, next);
        inner.phase = next;
        true
    }

    /// Records the committed backend and enters `Watching`.
    pub fn begin_watching(&self, backend: Backend, paths_watched: usize) {
        let mut inner = self.inner.lock();
        inner.backend = Some(backend);
        inner.paths_watched = paths_watched;
        inner.started_at = Some(Instant::now());
        Self::transition_locked(&mut inner, SessionPhase::Watching);
    }

    /// Enters `Stopped`, recording the end time once.
    pub fn mark_stopped(&self) {
        let mut inner = self.inner.lock();
        if Self::transition_locked(&mut inner, SessionPhase::Stopped) && inner.stopped_at.is_none()
        {
            inner.stopped_at = Some(Instant::now());
        }
    }

    /// Records the terminal error of the driver. Only the first one is kept.
    pub fn record_fatal(&self, error: String) {
        let mut inner = self.inner.lock();
        if inner.fatal_error.is_none() {
            inner.fatal_error = Some(error);
        } else {
            warn!("Discarding secondary fatal error: {}", error);
        }
    }

    /// Disowns a driver that did not stop in time.
    pub fn detach(&self) {
        self.detached.store(true, Release);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Acquire)
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.lock().phase
    }

    pub fn backend(&self) -> Option<Backend> {
        self.inner.lock().backend
    }

    /// Counts one dispatched event and remembers it in the recent buffer.
    pub fn record_event(&self, event: &WatchEvent) {
        self.events_processed.fetch_add(1, Relaxed);
        let mut inner = self.inner.lock();
        if inner.recent.len() == RECENT_EVENTS_CAPACITY {
            inner.recent.pop_front();
        }
        inner.recent.push_back(event.clone());
    }

    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Relaxed);
    }

    pub fn record_suppressed(&self) {
        self.suppressed.fetch_add(1, Relaxed);
    }

    pub fn record_callback_error(&self) {
        self.callback_errors.fetch_add(1, Relaxed);
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Relaxed)
    }

    /// Copies the recent-event buffer, oldest first.
    pub fn recent_events(&self) -> Vec<WatchEvent> {
        self.inner.lock().recent.iter().cloned().collect()
    }

    /// Builds a point-in-time statistics snapshot.
    ///
    /// # Arguments
    ///
    /// * `backend_totals` - Events per backend from earlier sessions of the
    ///   same watcher, merged with this session's count.
    pub fn snapshot(&self, backend_totals: &BTreeMap<Backend, u64>) -> WatchStatistics {
        let inner = self.inner.lock();
        let events_processed = self.events_processed.load(Relaxed);

        let uptime_seconds = match inner.started_at {
            Some(started) => inner
                .stopped_at
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(started)
                .as_secs_f64(),
            None => 0.0,
        };
        let events_per_second = if uptime_seconds > 0.0 {
            events_processed as f64 / uptime_seconds
        } else {
            0.0
        };

        let mut events_per_backend = backend_totals.clone();
        if let Some(backend) = inner.backend {
            *events_per_backend.entry(backend).or_default() += events_processed;
        }

        WatchStatistics {
            backend: inner.backend.map_or("none", Backend::as_str).to_string(),
            phase: inner.phase,
            watching: inner.phase == SessionPhase::Watching,
            uptime_seconds,
            events_processed,
            events_per_second,
            paths_watched: inner.paths_watched,
            drops: self.drops.load(Relaxed),
            suppressed: self.suppressed.load(Relaxed),
            callback_errors: self.callback_errors.load(Relaxed),
            events_per_backend,
            fatal_error: inner.fatal_error.clone(),
        }
    }
}

/// Point-in-time view of a watcher's activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchStatistics {
    /// Backend of the current or last session, `"none"` before the first start.
    pub backend: String,
    pub phase: SessionPhase,
    pub watching: bool,
    pub uptime_seconds: f64,
    /// Events dispatched to consumers after debouncing.
    pub events_processed: u64,
    pub events_per_second: f64,
    pub paths_watched: usize,
    /// Events displaced from full async queues.
    pub drops: u64,
    /// Raw events absorbed by the debouncer.
    pub suppressed: u64,
    pub callback_errors: u64,
    /// Cumulative dispatched events per backend over the watcher's lifetime.
    pub events_per_backend: BTreeMap<Backend, u64>,
    /// Why the session ended, if a driver failed.
    pub fatal_error: Option<String>,
}
