//! Fan-out of emitted events to synchronous callbacks and async queues.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering::Relaxed},
    },
};

use {
    anyhow::anyhow,
    async_channel::{Receiver, RecvError, Sender, TryRecvError, bounded},
    parking_lot::{Mutex, RwLock},
    tracing::{debug, trace},
};

use crate::{
    error::ErrorReporter,
    watcher::{events::WatchEvent, session::SessionState},
};

/// Synchronous event consumer.
///
/// Callbacks run on the driver thread, one at a time and in registration
/// order. A slow callback delays delivery of every later event.
pub type Callback = Arc<dyn Fn(&WatchEvent) -> anyhow::Result<()> + Send + Sync>;

/// Identifies a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

/// Registered synchronous consumers, in registration order.
#[derive(Default)]
pub struct CallbackRegistry {
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(CallbackHandle, Callback)>>,
}

impl CallbackRegistry {
    pub fn register<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&WatchEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handle = CallbackHandle(self.next_id.fetch_add(1, Relaxed));
        self.callbacks.write().push((handle, Arc::new(callback)));
        debug!("Registered callback {:?}", handle);
        handle
    }

    /// Removes a callback.
    ///
    /// # Returns
    ///
    /// `true` if the handle was registered.
    pub fn unregister(&self, handle: CallbackHandle) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(registered, _)| *registered != handle);
        before != callbacks.len()
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }

    /// Clones the current callback list so invocation happens without the lock,
    /// letting callbacks register or unregister consumers themselves.
    fn snapshot(&self) -> Vec<Callback> {
        self.callbacks
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }
}

#[derive(Default)]
struct Subscriptions {
    senders: Vec<Sender<WatchEvent>>,
    /// Set once the owning session was detached; nothing is accepted afterwards.
    retired: bool,
}

/// Async subscriptions that receive every event dispatched after they were created.
///
/// One set is shared by consecutive sessions of a watcher until a session
/// is detached, which retires its set for good.
#[derive(Default)]
pub struct SubscriberSet {
    inner: Mutex<Subscriptions>,
}

impl SubscriberSet {
    /// Creates a new bounded subscription.
    ///
    /// On a retired set the returned source is already closed.
    pub fn subscribe(&self, capacity: usize) -> AsyncEventSource {
        let (sender, receiver) = bounded(capacity.max(1));
        let mut inner = self.inner.lock();
        if inner.retired {
            sender.close();
        } else {
            inner.senders.push(sender);
        }
        AsyncEventSource { receiver }
    }

    /// Closes every subscription. Consumers drain what is queued, then see end-of-stream.
    pub fn close_all(&self) {
        for sender in self.inner.lock().senders.drain(..) {
            sender.close();
        }
    }

    /// Closes every subscription and refuses new ones.
    pub fn retire(&self) {
        let mut inner = self.inner.lock();
        inner.retired = true;
        for sender in inner.senders.drain(..) {
            sender.close();
        }
    }

    pub fn is_retired(&self) -> bool {
        self.inner.lock().retired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().senders.is_empty()
    }

    /// Pushes `event` to every live subscription without blocking.
    ///
    /// # Returns
    ///
    /// The number of events displaced from full queues.
    fn publish(&self, event: &WatchEvent) -> u64 {
        let mut dropped = 0;
        self.inner.lock().senders.retain(|sender| {
            if sender.receiver_count() == 0 {
                trace!("Removing abandoned async subscription");
                return false;
            }
            match sender.force_send(event.clone()) {
                Ok(Some(_oldest)) => {
                    dropped += 1;
                    true
                }
                Ok(None) => true,
                Err(_) => false,
            }
        });
        dropped
    }
}

/// Pull-based source of events for one async consumer.
///
/// Ends when the session stops. Receives only events dispatched after the
/// subscription was created; when the queue is full the oldest event is
/// discarded in favour of the newest.
#[derive(Debug, Clone)]
pub struct AsyncEventSource {
    receiver: Receiver<WatchEvent>,
}

impl AsyncEventSource {
    /// Waits for the next event, or `None` once the session has stopped and
    /// the queue is drained.
    pub async fn recv(&self) -> Option<WatchEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(RecvError) => None,
        }
    }

    /// Blocking variant of [`recv`](Self::recv) for non-async consumers.
    pub fn recv_blocking(&self) -> Option<WatchEvent> {
        self.receiver.recv_blocking().ok()
    }

    /// Returns a queued event without waiting.
    pub fn try_recv(&self) -> Option<WatchEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.receiver.capacity()
    }

    /// Whether the session closed this source.
    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }

    /// Unwraps the underlying channel, which also implements `futures_core::Stream`.
    pub fn into_receiver(self) -> Receiver<WatchEvent> {
        self.receiver
    }
}

/// Delivers each emitted event to every consumer class.
pub struct Dispatcher {
    callbacks: Arc<CallbackRegistry>,
    subscribers: Arc<SubscriberSet>,
    session: Arc<SessionState>,
}

impl Dispatcher {
    pub fn new(
        callbacks: Arc<CallbackRegistry>,
        subscribers: Arc<SubscriberSet>,
        session: Arc<SessionState>,
    ) -> Self {
        Self {
            callbacks,
            subscribers,
            session,
        }
    }

    /// Delivers one event.
    ///
    /// Callback failures, whether returned errors or panics, are logged and
    /// counted; they never stop delivery to the remaining callbacks.
    pub fn dispatch(&self, event: &WatchEvent) {
        if self.session.is_detached() {
            trace!("Discarding event from detached session: {}", event);
            return;
        }
        self.session.record_event(event);

        for callback in self.callbacks.snapshot() {
            let error = match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => error,
                Err(panic) => anyhow!("callback panicked: {}", panic_message(panic.as_ref())),
            };
            self.session.record_callback_error();
            ErrorReporter::warn(&error.context(format!("delivering {}", event)), "sync callback");
        }

        // A slow callback may have outlived the session's stop timeout.
        if self.session.is_detached() {
            trace!("Session detached during callbacks; not queueing {}", event);
            return;
        }

        for _ in 0..self.subscribers.publish(event) {
            self.session.record_drop();
        }
    }
}

/// Extracts the message of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering::SeqCst},
        },
    };

    use {anyhow::bail, parking_lot::Mutex};

    use crate::watcher::{
        dispatch::{CallbackRegistry, Dispatcher, SubscriberSet},
        events::{Backend, EventKind, WatchEvent},
        session::SessionState,
    };

    fn event(name: &str) -> WatchEvent {
        WatchEvent::new(
            PathBuf::from(format!("/d/{name}")),
            EventKind::Created,
            Backend::Polling,
            false,
        )
    }

    fn dispatcher() -> (
        Dispatcher,
        Arc<CallbackRegistry>,
        Arc<SubscriberSet>,
        Arc<SessionState>,
    ) {
        let callbacks = Arc::new(CallbackRegistry::default());
        let subscribers = Arc::new(SubscriberSet::default());
        let session = Arc::new(SessionState::initializing());
        let dispatcher = Dispatcher::new(callbacks.clone(), subscribers.clone(), session.clone());
        (dispatcher, callbacks, subscribers, session)
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let (dispatcher, callbacks, _, _) = dispatcher();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let order = order.clone();
            callbacks.register(move |_| {
                order.lock().push(id);
                Ok(())
            });
        }

        dispatcher.dispatch(&event("a"));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failing_callbacks_are_contained() {
        let (dispatcher, callbacks, _, session) = dispatcher();
        let delivered = Arc::new(AtomicUsize::new(0));

        callbacks.register(|_| bail!("scanner unavailable"));
        callbacks.register(|_| panic!("boom"));
        let counter = delivered.clone();
        callbacks.register(move |_| {
            counter.fetch_add(1, SeqCst);
            Ok(())
        });

        dispatcher.dispatch(&event("a"));
        assert_eq!(delivered.load(SeqCst), 1);
        assert_eq!(session.snapshot(&Default::default()).callback_errors, 2);
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let (dispatcher, callbacks, _, _) = dispatcher();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let handle = callbacks.register(move |_| {
            counter.fetch_add(1, SeqCst);
            Ok(())
        });

        dispatcher.dispatch(&event("a"));
        assert!(callbacks.unregister(handle));
        assert!(!callbacks.unregister(handle));
        dispatcher.dispatch(&event("b"));

        assert_eq!(delivered.load(SeqCst), 1);
        assert!(callbacks.is_empty());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let (dispatcher, _, subscribers, session) = dispatcher();
        let source = subscribers.subscribe(2);

        for name in ["a", "b", "c", "d", "e"] {
            dispatcher.dispatch(&event(name));
        }

        assert_eq!(session.snapshot(&Default::default()).drops, 3);
        assert_eq!(source.len(), 2);
        assert_eq!(source.try_recv().unwrap().path(), PathBuf::from("/d/d"));
        assert_eq!(source.try_recv().unwrap().path(), PathBuf::from("/d/e"));
        assert!(source.try_recv().is_none());
    }

    #[test]
    fn test_subscribers_see_only_later_events() {
        let (dispatcher, _, subscribers, _) = dispatcher();
        let early = subscribers.subscribe(10);
        dispatcher.dispatch(&event("a"));
        let late = subscribers.subscribe(10);
        dispatcher.dispatch(&event("b"));

        assert_eq!(early.len(), 2);
        assert_eq!(late.len(), 1);
        assert_eq!(late.try_recv().unwrap().path(), PathBuf::from("/d/b"));
    }

    #[test]
    fn test_dropped_sources_are_pruned() {
        let (dispatcher, _, subscribers, _) = dispatcher();
        let source = subscribers.subscribe(10);
        drop(source);

        dispatcher.dispatch(&event("a"));
        assert!(subscribers.is_empty());
    }

    #[test]
    fn test_close_all_ends_streams_after_drain() {
        let (dispatcher, _, subscribers, _) = dispatcher();
        let source = subscribers.subscribe(10);
        dispatcher.dispatch(&event("a"));
        subscribers.close_all();

        assert!(source.is_closed());
        assert!(source.recv_blocking().is_some());
        assert!(source.recv_blocking().is_none());
    }

    #[tokio::test]
    async fn test_async_recv() {
        let (dispatcher, _, subscribers, _) = dispatcher();
        let source = subscribers.subscribe(4);
        dispatcher.dispatch(&event("a"));
        subscribers.close_all();

        assert_eq!(source.recv().await.unwrap().path(), PathBuf::from("/d/a"));
        assert!(source.recv().await.is_none());
    }

    #[test]
    fn test_retired_set_refuses_subscriptions() {
        let (dispatcher, _, subscribers, _) = dispatcher();
        let existing = subscribers.subscribe(4);

        subscribers.retire();
        let late = subscribers.subscribe(4);
        dispatcher.dispatch(&event("a"));

        assert!(subscribers.is_retired());
        assert!(subscribers.is_empty());
        assert!(existing.is_closed());
        assert!(late.is_closed());
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn test_detach_during_callback_skips_queues() {
        let (dispatcher, callbacks, subscribers, session) = dispatcher();
        let source = subscribers.subscribe(4);
        let detaching = session.clone();
        callbacks.register(move |_| {
            detaching.detach();
            Ok(())
        });

        dispatcher.dispatch(&event("a"));

        assert!(source.is_empty());
        assert_eq!(session.events_processed(), 1);
    }

    #[test]
    fn test_detached_session_delivers_nothing() {
        let (dispatcher, callbacks, subscribers, session) = dispatcher();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        callbacks.register(move |_| {
            counter.fetch_add(1, SeqCst);
            Ok(())
        });
        let source = subscribers.subscribe(4);

        session.detach();
        dispatcher.dispatch(&event("a"));

        assert_eq!(delivered.load(SeqCst), 0);
        assert!(source.is_empty());
        assert_eq!(session.events_processed(), 0);
    }
}
