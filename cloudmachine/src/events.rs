//! # Blob lifecycle events
//!
//! Storage operations publish [`BlobEvent`]s to the aggregate's
//! [`EventListener`]. The listener delivers them to registered callbacks on
//! one dedicated background thread, in publish order.
//!
//! The dispatch thread is started explicitly with [`EventListener::start`].
//! Events published before that are buffered and delivered once it runs.
//! The buffer holds at most [`DEFAULT_EVENT_CAPACITY`] undelivered events
//! (see [`EventListener::with_capacity`]); events published while it is full
//! are dropped and counted in [`EventListener::dropped_events`].
//!
//! ```no_run
//! use cloudmachine::events::{EventKind, EventListener};
//!
//! let listener = EventListener::new();
//! listener.subscribe(EventKind::BlobCreated, |event| {
//!     println!("uploaded {}/{}", event.container, event.name);
//! });
//! listener.start()?;
//! # Ok::<(), cloudmachine::common::CloudMachineError>(())
//! ```

use crate::common::{CloudMachineError, CloudMachineResult};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

/// The named blob lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BlobCreated,
    BlobDeleted,
    BlobRenamed,
}

impl EventKind {
    /// The Event Grid event type this signal corresponds to.
    pub fn signal_name(&self) -> &'static str {
        match self {
            EventKind::BlobCreated => "Microsoft.Storage.BlobCreated",
            EventKind::BlobDeleted => "Microsoft.Storage.BlobDeleted",
            EventKind::BlobRenamed => "Microsoft.Storage.BlobRenamed",
        }
    }

    pub fn from_signal_name(name: &str) -> Option<Self> {
        match name {
            "Microsoft.Storage.BlobCreated" => Some(EventKind::BlobCreated),
            "Microsoft.Storage.BlobDeleted" => Some(EventKind::BlobDeleted),
            "Microsoft.Storage.BlobRenamed" => Some(EventKind::BlobRenamed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEvent {
    pub kind: EventKind,
    pub container: String,
    pub name: String,
    /// Set for [`EventKind::BlobRenamed`].
    pub previous_name: Option<String>,
}

impl BlobEvent {
    pub fn created(container: &str, name: &str) -> Self {
        Self::new(EventKind::BlobCreated, container, name)
    }

    pub fn deleted(container: &str, name: &str) -> Self {
        Self::new(EventKind::BlobDeleted, container, name)
    }

    pub fn renamed(container: &str, previous_name: &str, name: &str) -> Self {
        Self {
            previous_name: Some(previous_name.to_string()),
            ..Self::new(EventKind::BlobRenamed, container, name)
        }
    }

    fn new(kind: EventKind, container: &str, name: &str) -> Self {
        Self {
            kind,
            container: container.to_string(),
            name: name.to_string(),
            previous_name: None,
        }
    }
}

pub type EventCallback = Arc<dyn Fn(&BlobEvent) + Send + Sync>;

type Subscribers = Arc<RwLock<HashMap<EventKind, Vec<EventCallback>>>>;

/// Undelivered events a listener holds before it starts dropping new ones.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Fan-out of blob events to callbacks on a background thread.
pub struct EventListener {
    /// Taken on close; the dispatch loop ends once the queue is drained.
    sender: Mutex<Option<flume::Sender<BlobEvent>>>,
    receiver: flume::Receiver<BlobEvent>,
    subscribers: Subscribers,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl EventListener {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// A listener that buffers at most `capacity` undelivered events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = flume::bounded(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            thread: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers `callback` for `kind`. Any number of callbacks may be
    /// registered per kind; they run in registration order.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&BlobEvent) + Send + Sync + 'static,
    {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.entry(kind).or_default().push(Arc::new(callback));
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Queues `event` for delivery without blocking.
    ///
    /// Events published after close, or while the buffer is full, are
    /// dropped.
    pub fn publish(&self, event: BlobEvent) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = sender.as_ref() else {
            log::debug!(
                "Listener closed, dropping {} for {}",
                event.kind.signal_name(),
                event.name
            );
            return;
        };

        match sender.try_send(event) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "Event buffer full ({} pending), dropping {} for '{}' ({dropped} dropped so far)",
                    self.receiver.len(),
                    event.kind.signal_name(),
                    event.name
                );
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                log::warn!("Event channel disconnected, event dropped");
            }
        }
    }

    /// Events discarded because the buffer was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events published but not yet handed to a callback.
    pub fn pending_events(&self) -> usize {
        self.receiver.len()
    }

    /// Starts the dispatch thread. Calling it while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CloudMachineError::Closed`] after [`EventListener::close`], and
    /// [`CloudMachineError::Internal`] if the thread cannot be spawned.
    pub fn start(&self) -> CloudMachineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CloudMachineError::Closed);
        }

        let mut thread = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if thread.is_some() {
            return Ok(());
        }

        let receiver = self.receiver.clone();
        let subscribers = Arc::clone(&self.subscribers);
        let handle = std::thread::Builder::new()
            .name("cloudmachine-events".to_string())
            .spawn(move || dispatch_loop(receiver, subscribers))
            .map_err(|e| {
                CloudMachineError::Internal(format!("Failed to start event listener: {e}"))
            })?;

        *thread = Some(handle);
        self.started.store(true, Ordering::Release);
        log::info!("Event listener started");
        Ok(())
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// True while the dispatch thread is alive.
    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Signals the dispatch loop to stop after the events already queued.
    /// Safe on a listener that never started or is already closed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        log::debug!("Event listener close requested");
    }

    /// Waits for the dispatch thread to exit. Returns whether a thread was
    /// joined.
    pub fn join(&self) -> bool {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    log::warn!("Event listener thread terminated abnormally");
                }
                log::info!("Event listener stopped");
                true
            }
            None => false,
        }
    }

    /// [`close`](Self::close) followed by [`join`](Self::join).
    pub fn stop(&self) -> bool {
        self.close();
        self.join()
    }
}

impl Default for EventListener {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(receiver: flume::Receiver<BlobEvent>, subscribers: Subscribers) {
    while let Ok(event) = receiver.recv() {
        let callbacks: Vec<EventCallback> = subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                log::error!(
                    "Event callback for {} panicked on '{}'",
                    event.kind.signal_name(),
                    event.name
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_signal_names_round_trip() {
        for kind in [
            EventKind::BlobCreated,
            EventKind::BlobDeleted,
            EventKind::BlobRenamed,
        ] {
            assert_eq!(EventKind::from_signal_name(kind.signal_name()), Some(kind));
        }
        assert_eq!(EventKind::from_signal_name("Microsoft.Storage.Other"), None);
    }

    #[test]
    fn test_events_published_before_start_are_delivered_in_order() {
        let listener = EventListener::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        listener.subscribe(EventKind::BlobCreated, move |event| {
            sink.lock().unwrap().push(event.name.clone());
        });

        listener.publish(BlobEvent::created("default", "a.txt"));
        listener.publish(BlobEvent::created("default", "b.txt"));
        listener.start().unwrap();
        listener.publish(BlobEvent::created("default", "c.txt"));
        assert!(listener.stop());

        assert_eq!(*seen.lock().unwrap(), vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn test_callbacks_only_see_their_kind() {
        let listener = EventListener::new();
        let created = Arc::new(AtomicUsize::new(0));
        let deleted = Arc::new(AtomicUsize::new(0));
        let (c, d) = (created.clone(), deleted.clone());
        listener.subscribe(EventKind::BlobCreated, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        listener.subscribe(EventKind::BlobDeleted, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        listener.start().unwrap();
        listener.publish(BlobEvent::created("default", "a"));
        listener.publish(BlobEvent::deleted("default", "a"));
        listener.publish(BlobEvent::deleted("default", "b"));
        listener.stop();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(deleted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_dispatch() {
        let listener = EventListener::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        listener.subscribe(EventKind::BlobCreated, |event| {
            if event.name == "bad" {
                panic!("callback failure");
            }
        });
        listener.subscribe(EventKind::BlobCreated, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        listener.start().unwrap();
        listener.publish(BlobEvent::created("default", "bad"));
        listener.publish(BlobEvent::created("default", "good"));
        listener.stop();

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_idle_listener_buffer_is_bounded() {
        let listener = EventListener::with_capacity(3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        listener.subscribe(EventKind::BlobCreated, move |event| {
            sink.lock().unwrap().push(event.name.clone());
        });

        for i in 0..10 {
            listener.publish(BlobEvent::created("default", &format!("{i}.txt")));
        }
        assert_eq!(listener.pending_events(), 3);
        assert_eq!(listener.dropped_events(), 7);

        listener.start().unwrap();
        assert!(listener.stop());

        assert_eq!(*seen.lock().unwrap(), vec!["0.txt", "1.txt", "2.txt"]);
    }

    #[test]
    fn test_close_drops_later_events() {
        let listener = EventListener::with_capacity(4);

        listener.close();
        listener.publish(BlobEvent::created("default", "late"));

        assert_eq!(listener.pending_events(), 0);
        assert_eq!(listener.dropped_events(), 0);
    }

    #[test]
    fn test_close_without_start() {
        let listener = EventListener::new();

        listener.close();
        listener.close();

        assert!(!listener.has_started());
        assert!(!listener.join());
        assert!(matches!(listener.start(), Err(CloudMachineError::Closed)));
    }

    #[test]
    fn test_start_is_idempotent() {
        let listener = EventListener::new();

        listener.start().unwrap();
        listener.start().unwrap();

        assert!(listener.is_running());
        assert!(listener.stop());
        assert!(!listener.is_running());
    }
}
