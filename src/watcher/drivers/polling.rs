//! Polling driver: periodic directory walks diffed against a snapshot.
//!
//! Always available, so it terminates the fallback chain. Memory grows with
//! the number of watched entries, and changes are only noticed once per
//! poll interval.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{read_dir, symlink_metadata},
    io::{Error as IoError, ErrorKind},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{debug, trace, warn};

use crate::{
    error::DriverError,
    watcher::{
        drivers::{DriverContext, WatchRoot},
        events::{Backend, EventKind, WatchEvent},
        filter::normalize_path,
    },
};

/// What the poller remembers about an entry between walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub mtime: Option<SystemTime>,
    pub size: u64,
    pub is_dir: bool,
}

/// Entries found by one walk, keyed by path.
pub type Snapshot = BTreeMap<PathBuf, Fingerprint>;

/// Result of walking all roots.
#[derive(Debug, Default)]
struct WalkOutcome {
    snapshot: Snapshot,
    /// Errors on roots or directories, excluding entries that vanished mid-walk.
    errors: Vec<IoError>,
    /// Roots that could not be read at all.
    failed_roots: usize,
}

/// Periodically walks the watched roots and diffs consecutive snapshots.
#[derive(Debug)]
pub struct PollingDriver {
    roots: Vec<WatchRoot>,
    interval: Duration,
    snapshot: Snapshot,
}

impl PollingDriver {
    /// Creates the driver and takes the baseline snapshot.
    ///
    /// Entries present at this point are not reported.
    ///
    /// # Arguments
    ///
    /// * `roots` - Directories to watch.
    /// * `interval` - Time between walks.
    pub fn new(roots: Vec<WatchRoot>, interval: Duration) -> Self {
        let baseline = walk_roots(&roots);
        for error in &baseline.errors {
            warn!("Error while taking baseline snapshot: {}", error);
        }
        debug!(
            "Polling baseline holds {} entries across {} roots",
            baseline.snapshot.len(),
            roots.len()
        );
        Self {
            roots,
            interval,
            snapshot: baseline.snapshot,
        }
    }

    pub fn roots_watched(&self) -> usize {
        self.roots.len()
    }

    /// Runs the poll loop.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::TooManyErrors` when walks keep failing.
    pub fn run(mut self, context: &mut DriverContext) -> Result<(), DriverError> {
        while context.sleep(self.interval) {
            let outcome = walk_roots(&self.roots);

            if outcome.failed_roots == self.roots.len() {
                let error = outcome
                    .errors
                    .into_iter()
                    .next()
                    .map_or_else(|| "all roots unreadable".to_string(), |e| e.to_string());
                // Keep the old snapshot so a transient outage doesn't look like mass deletion.
                context.errors.failure(Backend::Polling, error)?;
                continue;
            }
            for error in &outcome.errors {
                warn!("Polling walk error: {}", error);
            }
            context.errors.success();

            for event in diff_snapshots(&self.snapshot, &outcome.snapshot) {
                context.pipeline.submit(event);
            }
            self.snapshot = outcome.snapshot;
        }
        Ok(())
    }
}

fn walk_roots(roots: &[WatchRoot]) -> WalkOutcome {
    let mut outcome = WalkOutcome::default();
    for root in roots {
        if let Err(error) = walk_dir(&root.path, root.recursive, &mut outcome) {
            outcome.errors.push(error);
            outcome.failed_roots += 1;
        }
    }
    outcome
}

/// Records the entries of `dir`, descending into subdirectories when
/// `recursive`. Symlinks are recorded but not followed.
fn walk_dir(dir: &Path, recursive: bool, outcome: &mut WalkOutcome) -> Result<(), IoError> {
    for entry in read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                outcome.errors.push(error);
                continue;
            }
        };
        let path = normalize_path(&entry.path());
        let metadata = match symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                trace!("Entry vanished during walk: {:?}", path);
                continue;
            }
            Err(error) => {
                outcome.errors.push(error);
                continue;
            }
        };

        let is_dir = metadata.is_dir();
        outcome.snapshot.insert(
            path.clone(),
            Fingerprint {
                mtime: metadata.modified().ok(),
                size: metadata.len(),
                is_dir,
            },
        );

        if is_dir && recursive {
            match walk_dir(&path, true, outcome) {
                Err(error) if error.kind() != ErrorKind::NotFound => outcome.errors.push(error),
                _ => {}
            }
        }
    }
    Ok(())
}

/// Derives change events between two snapshots.
///
/// A deletion and a creation in the same cycle whose fingerprints match are
/// reported as a move: `Deleted(old)` immediately followed by `Created(new)`,
/// each linked to the other path. The match is a heuristic; files with
/// identical size and mtime (e.g. empty files) can be paired wrongly or
/// not at all.
#[must_use]
pub fn diff_snapshots(previous: &Snapshot, current: &Snapshot) -> Vec<WatchEvent> {
    let mut events = Vec::new();

    let mut created: BTreeSet<&PathBuf> = current
        .keys()
        .filter(|path| !previous.contains_key(*path))
        .collect();

    for (path, old) in previous {
        if current.contains_key(path) {
            continue;
        }
        let moved_to = created
            .iter()
            .copied()
            .find(|candidate| current.get(*candidate) == Some(old));

        match moved_to {
            Some(new_path) => {
                created.remove(new_path);
                events.push(
                    WatchEvent::new(path.clone(), EventKind::Deleted, Backend::Polling, old.is_dir)
                        .with_related_path(new_path.clone()),
                );
                events.push(
                    WatchEvent::new(
                        new_path.clone(),
                        EventKind::Created,
                        Backend::Polling,
                        old.is_dir,
                    )
                    .with_related_path(path.clone()),
                );
            }
            None => events.push(WatchEvent::new(
                path.clone(),
                EventKind::Deleted,
                Backend::Polling,
                old.is_dir,
            )),
        }
    }

    for path in created {
        let is_dir = current.get(path).is_some_and(|fingerprint| fingerprint.is_dir);
        events.push(WatchEvent::new(
            path.clone(),
            EventKind::Created,
            Backend::Polling,
            is_dir,
        ));
    }

    for (path, new) in current {
        // Directory mtimes change with their children; those are reported individually.
        if new.is_dir {
            continue;
        }
        if let Some(old) = previous.get(path)
            && (old.mtime != new.mtime || old.size != new.size || old.is_dir != new.is_dir)
        {
            events.push(WatchEvent::new(
                path.clone(),
                EventKind::Modified,
                Backend::Polling,
                false,
            ));
        }
    }

    events
}
