//! Canonical file system event definitions.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    time::{Instant, SystemTime},
};

use serde::{Deserialize, Serialize};

/// Kind of change reported for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// The entry appeared.
    Created,
    /// The entry's content changed.
    Modified,
    /// The entry disappeared.
    Deleted,
    /// The entry was renamed away from this path.
    MovedFrom,
    /// The entry was renamed to this path.
    MovedTo,
}

impl EventKind {
    /// Whether the entry no longer exists at the path after this event.
    #[must_use]
    pub fn is_removal(self) -> bool {
        matches!(self, Self::Deleted | Self::MovedFrom)
    }

    /// Whether an event of this kind, seen within the debounce window after
    /// `current`, carries information `current` does not.
    ///
    /// Kinds that leave the entry present (`Created`, `Modified`, `MovedTo`)
    /// absorb each other; a flip between presence and absence supersedes.
    #[must_use]
    pub fn supersedes(self, current: EventKind) -> bool {
        self != current && self.is_removal() != current.is_removal()
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::MovedFrom => "moved_from",
            Self::MovedTo => "moved_to",
        };
        f.write_str(name)
    }
}

/// Backend driver that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Kernel-level notification (fanotify), requires root.
    Privileged,
    /// Cross-platform watcher library (`notify`).
    UserSpace,
    /// Periodic directory walks.
    Polling,
}

impl Backend {
    /// Stable identifier used in logs and statistics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Privileged => "privileged",
            Self::UserSpace => "userspace",
            Self::Polling => "polling",
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Detection time of an event, on both clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTimestamp {
    /// Monotonic instant, used for debouncing and ordering.
    pub monotonic: Instant,
    /// Wall clock time, for display and correlation.
    pub wall: SystemTime,
}

impl EventTimestamp {
    /// Captures the current time.
    #[must_use]
    pub fn now() -> Self {
        Self {
            monotonic: Instant::now(),
            wall: SystemTime::now(),
        }
    }
}

/// Backend-agnostic change notification.
///
/// Events are never mutated after a driver creates them; the debouncer
/// either forwards, holds or drops them whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    path: PathBuf,
    kind: EventKind,
    timestamp: EventTimestamp,
    backend: Backend,
    is_directory: bool,
    related_path: Option<PathBuf>,
}

impl WatchEvent {
    /// Creates an event stamped with the current time.
    ///
    /// # Arguments
    ///
    /// * `path` - Absolute, normalized path of the affected entry.
    /// * `kind` - What happened to it.
    /// * `backend` - Driver that detected the change.
    /// * `is_directory` - Whether the entry is a directory.
    pub fn new(path: PathBuf, kind: EventKind, backend: Backend, is_directory: bool) -> Self {
        Self {
            path,
            kind,
            timestamp: EventTimestamp::now(),
            backend,
            is_directory,
            related_path: None,
        }
    }

    /// Links this event to the other side of a move.
    #[must_use]
    pub fn with_related_path(mut self, related: PathBuf) -> Self {
        self.related_path = Some(related);
        self
    }

    /// Overrides the detection time.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: EventTimestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn timestamp(&self) -> EventTimestamp {
        self.timestamp
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// For moves, the path on the other side of the rename, when known.
    pub fn related_path(&self) -> Option<&Path> {
        self.related_path.as_deref()
    }
}

impl Display for WatchEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{} {}", self.kind, self.path.display())?;
        if let Some(related) = &self.related_path {
            write!(f, " ({})", related.display())?;
        }
        Ok(())
    }
}
