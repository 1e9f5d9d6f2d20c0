//! User-space driver backed by the `notify` crate.
//!
//! `notify` runs its own observer thread and hands events to a channel; the
//! driver thread drains that channel and translates events. If the
//! observer thread dies, its end of the channel is dropped and the driver
//! reports the session as failed instead of waiting forever.

use std::{
    path::{Path, PathBuf},
    sync::mpsc::{Receiver, RecvTimeoutError, channel},
};

use {
    notify::{
        Config, Event, RecommendedWatcher,
        RecursiveMode::{NonRecursive, Recursive},
        Watcher,
        event::{CreateKind, EventKind as NotifyKind, ModifyKind, RemoveKind, RenameMode},
    },
    tracing::{debug, error, warn},
};

use crate::{
    error::DriverError,
    watcher::{
        drivers::{DriverContext, TICK_INTERVAL, WatchRoot},
        events::{Backend, EventKind, WatchEvent},
        filter::normalize_path,
    },
};

/// Whether the platform's recommended watcher can be instantiated.
pub fn probe() -> Result<(), DriverError> {
    RecommendedWatcher::new(|_: notify::Result<Event>| {}, Config::default())?;
    Ok(())
}

/// Watches roots through `notify::RecommendedWatcher`.
pub struct UserSpaceDriver {
    /// Keeps the OS watch alive; dropping it stops the observer thread.
    _watcher: RecommendedWatcher,
    receiver: Receiver<notify::Result<Event>>,
    roots_watched: usize,
}

impl UserSpaceDriver {
    /// Creates the watcher and registers every root.
    ///
    /// Roots that cannot be registered are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `DriverError` if the watcher cannot be created or no root
    /// could be registered.
    pub fn new(roots: &[WatchRoot]) -> Result<Self, DriverError> {
        let (sender, receiver) = channel();
        let mut watcher = RecommendedWatcher::new(sender, Config::default())?;

        let mut roots_watched = 0;
        for root in roots {
            let mode = if root.recursive { Recursive } else { NonRecursive };
            match watcher.watch(&root.path, mode) {
                Ok(()) => {
                    debug!("Started watching directory: {:?}", root.path);
                    roots_watched += 1;
                }
                Err(e) => warn!("Failed to watch directory {:?}: {}", root.path, e),
            }
        }
        if roots_watched == 0 {
            return Err(DriverError::unavailable("no root could be registered"));
        }

        Ok(Self {
            _watcher: watcher,
            receiver,
            roots_watched,
        })
    }

    /// Wraps a channel the caller controls; no root is registered.
    #[cfg(test)]
    pub(crate) fn from_receiver(
        receiver: Receiver<notify::Result<Event>>,
    ) -> Result<Self, DriverError> {
        let watcher = RecommendedWatcher::new(|_: notify::Result<Event>| {}, Config::default())?;
        Ok(Self {
            _watcher: watcher,
            receiver,
            roots_watched: 1,
        })
    }

    pub fn roots_watched(&self) -> usize {
        self.roots_watched
    }

    /// Drains library events until stopped.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::WatcherThreadDied` if the library's thread
    /// disappears, or `DriverError::TooManyErrors` if it keeps reporting errors.
    pub fn run(self, context: &mut DriverContext) -> Result<(), DriverError> {
        loop {
            if context.should_stop() {
                return Ok(());
            }
            match self.receiver.recv_timeout(TICK_INTERVAL) {
                Ok(Ok(event)) => {
                    context.errors.success();
                    if event.need_rescan() {
                        warn!("Watcher library dropped events; some changes may be missing");
                    }
                    for translated in translate_event(&event) {
                        context.pipeline.submit(translated);
                    }
                }
                Ok(Err(e)) => context.errors.failure(Backend::UserSpace, e)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    error!("Watcher library thread disconnected");
                    return Err(DriverError::WatcherThreadDied);
                }
            }
            context.pipeline.tick();
        }
    }
}

/// Translates a library event into canonical events.
///
/// Access and attribute-only events are ignored. A rename reported with
/// both paths becomes a linked `MovedFrom`/`MovedTo` pair.
pub fn translate_event(event: &Event) -> Vec<WatchEvent> {
    let paths: Vec<PathBuf> = event.paths.iter().map(|p| normalize_path(p)).collect();

    let single = |kind: EventKind, is_dir: Option<bool>| -> Vec<WatchEvent> {
        paths
            .iter()
            .map(|path| {
                let is_dir = is_dir.unwrap_or_else(|| path.is_dir());
                WatchEvent::new(path.clone(), kind, Backend::UserSpace, is_dir)
            })
            .collect()
    };

    match event.kind {
        NotifyKind::Create(kind) => single(EventKind::Created, folder_hint_create(kind)),
        NotifyKind::Remove(kind) => single(EventKind::Deleted, Some(folder_hint_remove(kind))),
        NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let (from, to) = (&paths[0], &paths[1]);
            let is_dir = to.is_dir();
            vec![
                WatchEvent::new(from.clone(), EventKind::MovedFrom, Backend::UserSpace, is_dir)
                    .with_related_path(to.clone()),
                WatchEvent::new(to.clone(), EventKind::MovedTo, Backend::UserSpace, is_dir)
                    .with_related_path(from.clone()),
            ]
        }
        NotifyKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            single(EventKind::MovedFrom, Some(false))
        }
        NotifyKind::Modify(ModifyKind::Name(RenameMode::To)) => single(EventKind::MovedTo, None),
        NotifyKind::Modify(ModifyKind::Name(_)) => paths
            .iter()
            .map(|path| renamed_by_existence(path))
            .collect(),
        NotifyKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => {
            single(EventKind::Modified, None)
        }
        _ => {
            debug!("Ignoring event kind {:?} for {:?}", event.kind, paths);
            Vec::new()
        }
    }
}

fn folder_hint_create(kind: CreateKind) -> Option<bool> {
    match kind {
        CreateKind::Folder => Some(true),
        CreateKind::File => Some(false),
        _ => None,
    }
}

fn folder_hint_remove(kind: RemoveKind) -> bool {
    matches!(kind, RemoveKind::Folder)
}

/// Classifies a rename with an unknown direction by whether the path still exists.
fn renamed_by_existence(path: &Path) -> WatchEvent {
    let exists = path.exists();
    let kind = if exists {
        EventKind::MovedTo
    } else {
        EventKind::MovedFrom
    };
    WatchEvent::new(path.to_path_buf(), kind, Backend::UserSpace, exists && path.is_dir())
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{Arc, mpsc::channel},
        time::{Duration, Instant},
    };

    use notify::{
        Event,
        event::{
            AccessKind, CreateKind, DataChange, EventKind as NotifyKind, ModifyKind, RemoveKind,
            RenameMode,
        },
    };

    use crate::{
        error::DriverError,
        watcher::{
            dispatch::SubscriberSet,
            drivers::{
                tests::driver_context,
                userspace::{UserSpaceDriver, translate_event},
            },
            events::{Backend, EventKind},
            session::SessionState,
        },
    };

    fn notify_event(kind: NotifyKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn test_translate_basic_kinds() {
        let cases = vec![
            (NotifyKind::Create(CreateKind::File), Some(EventKind::Created)),
            (
                NotifyKind::Modify(ModifyKind::Data(DataChange::Content)),
                Some(EventKind::Modified),
            ),
            (NotifyKind::Remove(RemoveKind::File), Some(EventKind::Deleted)),
            (
                NotifyKind::Modify(ModifyKind::Name(RenameMode::From)),
                Some(EventKind::MovedFrom),
            ),
            (NotifyKind::Access(AccessKind::Any), None),
        ];

        for (kind, expected) in cases {
            let events = translate_event(&notify_event(kind, &["/nonexistent/a.txt"]));
            assert_eq!(
                events.first().map(|event| event.kind()),
                expected,
                "Failed for kind: {:?}",
                kind
            );
        }
    }

    #[test]
    fn test_translate_rename_both() {
        let events = translate_event(&notify_event(
            NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/nonexistent/a.txt", "/nonexistent/b.txt"],
        ));

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), EventKind::MovedFrom);
        assert_eq!(events[1].kind(), EventKind::MovedTo);
        assert_eq!(
            events[1].related_path(),
            Some(PathBuf::from("/nonexistent/a.txt").as_path())
        );
    }

    #[test]
    fn test_translate_folder_hints() {
        let created = translate_event(&notify_event(
            NotifyKind::Create(CreateKind::Folder),
            &["/nonexistent/dir"],
        ));
        assert!(created[0].is_directory());

        let removed = translate_event(&notify_event(
            NotifyKind::Remove(RemoveKind::Folder),
            &["/nonexistent/dir"],
        ));
        assert!(removed[0].is_directory());
    }

    #[test]
    fn test_translate_normalizes_paths() {
        let events = translate_event(&notify_event(
            NotifyKind::Create(CreateKind::File),
            &["/nonexistent/sub/../a.txt"],
        ));
        assert_eq!(events[0].path(), PathBuf::from("/nonexistent/a.txt"));
    }

    #[test]
    fn test_dead_library_thread_fails_the_driver() {
        let (sender, receiver) = channel();
        drop(sender);
        let driver = UserSpaceDriver::from_receiver(receiver).unwrap();
        let session = Arc::new(SessionState::initializing());
        let mut context = driver_context(&session, &Arc::new(SubscriberSet::default()), 3);

        let started = Instant::now();
        assert!(matches!(
            driver.run(&mut context),
            Err(DriverError::WatcherThreadDied)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_library_errors_exhaust_budget() {
        let (sender, receiver) = channel();
        for _ in 0..3 {
            sender
                .send(Err(notify::Error::generic("inotify read failed")))
                .unwrap();
        }
        let driver = UserSpaceDriver::from_receiver(receiver).unwrap();
        let session = Arc::new(SessionState::initializing());
        let mut context = driver_context(&session, &Arc::new(SubscriberSet::default()), 3);

        assert!(matches!(
            driver.run(&mut context),
            Err(DriverError::TooManyErrors { count: 3, .. })
        ));
        drop(sender);
    }

    #[test]
    fn test_library_events_reach_the_pipeline() {
        let (sender, receiver) = channel();
        sender
            .send(Ok(notify_event(
                NotifyKind::Create(CreateKind::File),
                &["/nonexistent/a.txt"],
            )))
            .unwrap();
        drop(sender);

        let driver = UserSpaceDriver::from_receiver(receiver).unwrap();
        let session = Arc::new(SessionState::initializing());
        let subscribers = Arc::new(SubscriberSet::default());
        let source = subscribers.subscribe(4);
        let mut context = driver_context(&session, &subscribers, 3);

        assert!(driver.run(&mut context).is_err());
        let event = source.try_recv().unwrap();
        assert_eq!(event.kind(), EventKind::Created);
        assert_eq!(event.backend(), Backend::UserSpace);
    }
}
