//! Per-path debouncing that collapses event storms.

use std::{
    collections::HashMap,
    path::PathBuf,
    time::{Duration, Instant},
};

use tracing::trace;

use crate::watcher::events::{EventKind, WatchEvent};

/// Debounce state of one path.
#[derive(Debug)]
struct DebounceEntry {
    /// When an event for this path was last emitted.
    last_emitted: Instant,
    /// Kind of the last emitted event.
    emitted_kind: EventKind,
    /// Superseding event held back until the window closes.
    pending: Option<WatchEvent>,
}

/// Leading-edge debouncer with trailing emission of superseding kinds.
///
/// The first event for a path is emitted immediately. Further events within
/// the window are suppressed, unless their kind supersedes the last one
/// (e.g. `Deleted` after `Modified`); the newest superseding event is then
/// held and emitted once the window expires.
///
/// The table is owned by the driver context that feeds it, so it takes
/// `&mut self` and needs no locking.
#[derive(Debug)]
pub struct Debouncer {
    /// Suppression window. Zero disables debouncing.
    window: Duration,
    /// Per-path state, removed lazily once its window expires.
    entries: HashMap<PathBuf, DebounceEntry>,
}

impl Debouncer {
    /// Creates a new debouncer.
    ///
    /// # Arguments
    ///
    /// * `window` - Suppression window; `Duration::ZERO` forwards everything.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    /// Feeds one raw event observed at `now`.
    ///
    /// Events ready for dispatch are appended to `out` in emission order.
    ///
    /// # Returns
    ///
    /// `true` if the event was suppressed or held back.
    pub fn accept(&mut self, event: WatchEvent, now: Instant, out: &mut Vec<WatchEvent>) -> bool {
        if self.window.is_zero() {
            out.push(event);
            return false;
        }

        match self.entries.get_mut(event.path()) {
            Some(entry) if now.saturating_duration_since(entry.last_emitted) < self.window => {
                let current = entry
                    .pending
                    .as_ref()
                    .map_or(entry.emitted_kind, WatchEvent::kind);
                if event.kind().supersedes(current) {
                    trace!("Holding {} until window closes", event);
                    entry.pending = Some(event);
                } else if let Some(pending) = entry.pending.take() {
                    // Same class as the held event: keep its kind, take the newer timestamp.
                    entry.pending = Some(pending.with_timestamp(event.timestamp()));
                } else {
                    trace!("Suppressed {}", event);
                }
                true
            }
            Some(entry) => {
                if let Some(pending) = entry.pending.take() {
                    out.push(pending);
                }
                entry.last_emitted = now;
                entry.emitted_kind = event.kind();
                out.push(event);
                false
            }
            None => {
                self.entries.insert(
                    event.path().to_path_buf(),
                    DebounceEntry {
                        last_emitted: now,
                        emitted_kind: event.kind(),
                        pending: None,
                    },
                );
                out.push(event);
                false
            }
        }
    }

    /// Emits held events whose window has closed and drops idle entries.
    pub fn flush_expired(&mut self, now: Instant, out: &mut Vec<WatchEvent>) {
        let window = self.window;
        self.entries.retain(|_, entry| {
            if now.saturating_duration_since(entry.last_emitted) < window {
                return true;
            }
            match entry.pending.take() {
                Some(pending) => {
                    entry.last_emitted = now;
                    entry.emitted_kind = pending.kind();
                    out.push(pending);
                    true
                }
                None => false,
            }
        });
    }

    /// Emits every held event regardless of its window. Used at shutdown.
    pub fn drain(&mut self, out: &mut Vec<WatchEvent>) {
        let mut held: Vec<WatchEvent> = self
            .entries
            .drain()
            .filter_map(|(_, entry)| entry.pending)
            .collect();
        held.sort_by_key(|event| event.timestamp().monotonic);
        out.extend(held);
    }

    /// Number of paths currently tracked.
    pub fn tracked_paths(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        time::{Duration, Instant},
    };

    use crate::watcher::{
        debouncer::Debouncer,
        events::{Backend, EventKind, WatchEvent},
    };

    fn event(path: &str, kind: EventKind) -> WatchEvent {
        WatchEvent::new(PathBuf::from(path), kind, Backend::Polling, false)
    }

    #[test]
    fn test_rapid_modifications_collapse() {
        let mut debouncer = Debouncer::new(Duration::from_secs(1));
        let start = Instant::now();
        let mut out = Vec::new();

        for i in 0..5 {
            debouncer.accept(
                event("/d/a.txt", EventKind::Modified),
                start + Duration::from_millis(i * 40),
                &mut out,
            );
        }
        debouncer.flush_expired(start + Duration::from_secs(2), &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind(), EventKind::Modified);
        assert_eq!(debouncer.tracked_paths(), 0);
    }

    #[test]
    fn test_superseding_kind_is_emitted_after_window() {
        let mut debouncer = Debouncer::new(Duration::from_secs(1));
        let start = Instant::now();
        let mut out = Vec::new();

        debouncer.accept(event("/d/a.txt", EventKind::Modified), start, &mut out);
        debouncer.accept(
            event("/d/a.txt", EventKind::Modified),
            start + Duration::from_millis(100),
            &mut out,
        );
        debouncer.accept(
            event("/d/a.txt", EventKind::Deleted),
            start + Duration::from_millis(200),
            &mut out,
        );
        assert_eq!(out.len(), 1);

        debouncer.flush_expired(start + Duration::from_millis(500), &mut out);
        assert_eq!(out.len(), 1, "window still open");

        debouncer.flush_expired(start + Duration::from_millis(1100), &mut out);
        let kinds: Vec<_> = out.iter().map(WatchEvent::kind).collect();
        assert_eq!(kinds, vec![EventKind::Modified, EventKind::Deleted]);
    }

    #[test]
    fn test_events_outside_window_are_distinct() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100));
        let start = Instant::now();
        let mut out = Vec::new();

        debouncer.accept(event("/d/a.txt", EventKind::Created), start, &mut out);
        debouncer.accept(
            event("/d/a.txt", EventKind::Deleted),
            start + Duration::from_millis(150),
            &mut out,
        );

        let kinds: Vec<_> = out.iter().map(WatchEvent::kind).collect();
        assert_eq!(kinds, vec![EventKind::Created, EventKind::Deleted]);
    }

    #[test]
    fn test_zero_window_forwards_everything() {
        let mut debouncer = Debouncer::new(Duration::ZERO);
        let now = Instant::now();
        let mut out = Vec::new();

        for _ in 0..3 {
            assert!(!debouncer.accept(event("/d/a.txt", EventKind::Modified), now, &mut out));
        }
        assert_eq!(out.len(), 3);
        assert_eq!(debouncer.tracked_paths(), 0);
    }

    #[test]
    fn test_paths_are_independent() {
        let mut debouncer = Debouncer::new(Duration::from_secs(1));
        let now = Instant::now();
        let mut out = Vec::new();

        debouncer.accept(event("/d/a.txt", EventKind::Modified), now, &mut out);
        debouncer.accept(event("/d/b.txt", EventKind::Modified), now, &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_drain_emits_held_events() {
        let mut debouncer = Debouncer::new(Duration::from_secs(10));
        let now = Instant::now();
        let mut out = Vec::new();

        debouncer.accept(event("/d/a.txt", EventKind::Created), now, &mut out);
        debouncer.accept(event("/d/a.txt", EventKind::Deleted), now, &mut out);
        debouncer.drain(&mut out);

        let kinds: Vec<_> = out.iter().map(WatchEvent::kind).collect();
        assert_eq!(kinds, vec![EventKind::Created, EventKind::Deleted]);
        assert_eq!(debouncer.tracked_paths(), 0);
    }
}
