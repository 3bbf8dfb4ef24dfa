/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Session events and their delivery.
//!
//! Every observable occurrence in a session is a [`SessionEvent`]. Observers
//! register per [`EventKind`] on an [`EventDispatcher`], which delivers events
//! on a dedicated thread:
//! - Events raised by one component arrive in the order they were raised
//! - A panicking observer is logged and skipped; other observers still run
//! - Raising an event never waits for an observer
//!
//! Subscription-level observers receive [`SubscriptionEvent`]s through the same
//! delivery thread, so session and subscription events stay mutually ordered.

use crate::config::SessionConfig;
use crate::sequence::LostRange;
use crate::state::ConnectionState;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use ironua_core::error::{FaultSeverity, ServiceFault};
use ironua_core::notification::{NotificationMessage, SubscriptionAcknowledgement};
use ironua_core::types::SubscriptionId;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{error, trace, warn};

/// Observer calls slower than this are reported.
pub const SLOW_OBSERVER_THRESHOLD: Duration = Duration::from_millis(100);

/// Kind of a session event, used to register observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// Keep-alive timer tick.
    KeepAlive,
    /// A data notification was delivered.
    Publish,
    /// A publish request failed.
    PublishError,
    /// Acknowledgements were attached to an outgoing publish request.
    AcknowledgementsQueued,
    /// Subscriptions were added, removed, transferred or recreated.
    SubscriptionsChanged,
    /// Notifications were declared lost.
    DataLoss,
    /// The connection state changed.
    StateChanged,
    /// The session is closing.
    Closing,
    /// The session configuration was updated.
    ConfigurationChanged,
}

impl EventKind {
    /// All event kinds.
    pub const ALL: [Self; 9] = [
        Self::KeepAlive,
        Self::Publish,
        Self::PublishError,
        Self::AcknowledgementsQueued,
        Self::SubscriptionsChanged,
        Self::DataLoss,
        Self::StateChanged,
        Self::Closing,
        Self::ConfigurationChanged,
    ];
}

/// Keep-alive tick details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveEvent {
    /// Connection state at the tick.
    pub state: ConnectionState,
    /// Time since the last server activity.
    pub silent_for: Duration,
    /// True if the keep-alive deadline has passed.
    pub suspect: bool,
    /// Wall-clock time of the tick.
    pub timestamp: DateTime<Utc>,
}

/// Publish failure details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishErrorEvent {
    /// The fault returned by the server or transport.
    pub fault: ServiceFault,
    /// Severity of the fault.
    pub severity: FaultSeverity,
    /// Acknowledgements put back for the next request.
    pub acknowledgements_retained: usize,
}

/// Notifications declared lost for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLossEvent {
    /// The affected subscription.
    pub subscription_id: SubscriptionId,
    /// Lost ranges, in ascending order.
    pub lost: Vec<LostRange>,
}

impl DataLossEvent {
    /// Returns the total number of lost notifications.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.lost.iter().map(LostRange::count).sum()
    }
}

/// A change to the set of subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// Created by the application.
    Added(SubscriptionId),
    /// Deleted by the application.
    Removed(SubscriptionId),
    /// Moved to the reactivated session with its sequence state intact.
    Transferred(SubscriptionId),
    /// Recreated on the server under a new id.
    Recreated {
        /// Id before recovery.
        previous: SubscriptionId,
        /// Id assigned by the server.
        current: SubscriptionId,
    },
    /// Dropped during recovery.
    Deleted(SubscriptionId),
}

/// An observable session occurrence.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Keep-alive timer tick.
    KeepAlive(KeepAliveEvent),
    /// A deliverable data notification.
    Publish(NotificationMessage),
    /// A publish request failed.
    PublishError(PublishErrorEvent),
    /// Acknowledgements attached to an outgoing publish request.
    AcknowledgementsQueued(Vec<SubscriptionAcknowledgement>),
    /// The subscription set changed.
    SubscriptionsChanged(Vec<SubscriptionChange>),
    /// Notifications were declared lost.
    DataLoss(DataLossEvent),
    /// The connection state changed.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// The session is closing.
    Closing {
        /// Whether server-side subscriptions are deleted.
        delete_subscriptions: bool,
    },
    /// The configuration was updated.
    ConfigurationChanged(Box<SessionConfig>),
}

impl SessionEvent {
    /// Returns the kind used to route this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::KeepAlive(_) => EventKind::KeepAlive,
            Self::Publish(_) => EventKind::Publish,
            Self::PublishError(_) => EventKind::PublishError,
            Self::AcknowledgementsQueued(_) => EventKind::AcknowledgementsQueued,
            Self::SubscriptionsChanged(_) => EventKind::SubscriptionsChanged,
            Self::DataLoss(_) => EventKind::DataLoss,
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::Closing { .. } => EventKind::Closing,
            Self::ConfigurationChanged(_) => EventKind::ConfigurationChanged,
        }
    }
}

/// Event delivered to the observers of a single subscription.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// A deliverable data notification.
    Notification(NotificationMessage),
    /// Notifications were declared lost.
    DataLoss(DataLossEvent),
    /// The subscription moved to the reactivated session.
    Transferred,
    /// The subscription was recreated under a new id.
    Recreated {
        /// Id before recovery.
        previous: SubscriptionId,
    },
    /// The subscription no longer exists.
    Deleted,
}

/// Session-level observer callback.
pub type Observer = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Subscription-level observer callback.
pub type SubscriptionObserver = Arc<dyn Fn(&SubscriptionEvent) + Send + Sync>;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned on registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Allocates a process-unique id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// Registered session observers, grouped by kind.
#[derive(Clone, Default)]
pub struct ObserverSet {
    by_kind: HashMap<EventKind, Vec<(ObserverId, Observer)>>,
}

impl ObserverSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observer for `kind`.
    pub fn insert(&mut self, kind: EventKind, observer: Observer) -> ObserverId {
        let id = ObserverId::next();
        self.by_kind.entry(kind).or_default().push((id, observer));
        id
    }

    /// Removes an observer; returns true if it was registered.
    pub fn remove(&mut self, id: ObserverId) -> bool {
        let mut removed = false;
        for list in self.by_kind.values_mut() {
            let before = list.len();
            list.retain(|(existing, _)| *existing != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Returns the total number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn for_kind(&self, kind: EventKind) -> Vec<(ObserverId, Observer)> {
        self.by_kind.get(&kind).cloned().unwrap_or_default()
    }
}

impl fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSet")
            .field("len", &self.len())
            .finish()
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Routes events to registered observers on a dedicated delivery thread.
pub struct EventDispatcher {
    observers: RwLock<ObserverSet>,
    queue: Option<Sender<Job>>,
    worker: Option<ThreadId>,
}

impl EventDispatcher {
    /// Creates a dispatcher with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self::with_observers(ObserverSet::new())
    }

    /// Creates a dispatcher with the given observers already registered.
    ///
    /// If the delivery thread cannot be spawned, events are delivered on the
    /// raising thread instead.
    #[must_use]
    pub fn with_observers(observers: ObserverSet) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let spawned = thread::Builder::new()
            .name("ironua-events".to_string())
            .spawn(move || run_worker(&rx));

        let (queue, worker) = match spawned {
            Ok(handle) => (Some(tx), Some(handle.thread().id())),
            Err(err) => {
                error!(error = %err, "failed to spawn event thread; delivering inline");
                (None, None)
            }
        };

        Self {
            observers: RwLock::new(observers),
            queue,
            worker,
        }
    }

    /// Registers `observer` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, observer: F) -> ObserverId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.observers.write().insert(kind, Arc::new(observer))
    }

    /// Unregisters an observer; returns true if it was registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.observers.write().remove(id)
    }

    /// Queues `event` for every observer registered for its kind.
    ///
    /// Observers are snapshotted here, so an observer added after this call
    /// does not see the event.
    pub fn emit(&self, event: SessionEvent) {
        let observers = self.observers.read().for_kind(event.kind());
        if observers.is_empty() {
            trace!(kind = ?event.kind(), "no observers for event");
            return;
        }
        self.enqueue(Box::new(move || {
            for (id, observer) in &observers {
                invoke(*id, observer.as_ref(), &event);
            }
        }));
    }

    /// Queues `event` for the given subscription observers.
    pub fn deliver(
        &self,
        observers: Vec<(ObserverId, SubscriptionObserver)>,
        event: SubscriptionEvent,
    ) {
        if observers.is_empty() {
            return;
        }
        self.enqueue(Box::new(move || {
            for (id, observer) in &observers {
                invoke(*id, observer.as_ref(), &event);
            }
        }));
    }

    /// Blocks until every event queued before this call has been delivered.
    ///
    /// Returns false if `timeout` elapsed first. Called from an observer it
    /// returns true immediately.
    pub fn flush(&self, timeout: Duration) -> bool {
        let Some(queue) = &self.queue else {
            return true;
        };
        if self.worker == Some(thread::current().id()) {
            return true;
        }
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let job: Job = Box::new(move || {
            let _ = done_tx.send(());
        });
        if queue.send(job).is_err() {
            return true;
        }
        done_rx.recv_timeout(timeout).is_ok()
    }

    /// Returns a copy of the registered observers.
    #[must_use]
    pub fn observers(&self) -> ObserverSet {
        self.observers.read().clone()
    }

    /// Creates an independent dispatcher carrying the same observers.
    #[must_use]
    pub fn clone_observers(&self) -> Self {
        Self::with_observers(self.observers())
    }

    /// Returns the number of observers registered for `kind`.
    #[must_use]
    pub fn observer_count(&self, kind: EventKind) -> usize {
        self.observers
            .read()
            .by_kind
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Returns the total number of registered observers.
    #[must_use]
    pub fn total_observer_count(&self) -> usize {
        self.observers.read().len()
    }

    fn enqueue(&self, job: Job) {
        match &self.queue {
            Some(queue) => {
                if let Err(err) = queue.send(job) {
                    // worker gone; run on the caller rather than drop the event
                    (err.into_inner())();
                }
            }
            None => job(),
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("observers", &self.total_observer_count())
            .field("threaded", &self.queue.is_some())
            .finish()
    }
}

fn run_worker(rx: &Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        job();
    }
    trace!("event thread exiting");
}

fn invoke<E: ?Sized>(id: ObserverId, observer: &(dyn Fn(&E) + Send + Sync), event: &E) {
    let started = Instant::now();
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(event))) {
        error!(observer = %id, reason = panic_message(panic.as_ref()), "observer panicked");
        return;
    }
    let elapsed = started.elapsed();
    if elapsed > SLOW_OBSERVER_THRESHOLD {
        warn!(
            observer = %id,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow observer is delaying event delivery"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ironua_core::types::SequenceNumber;
    use parking_lot::Mutex;

    fn notification(seq: u32) -> SessionEvent {
        SessionEvent::Publish(NotificationMessage::new(
            SubscriptionId::new(1),
            SequenceNumber::new(seq),
            Bytes::from_static(b"v"),
        ))
    }

    fn sequence_of(event: &SessionEvent) -> u32 {
        match event {
            SessionEvent::Publish(n) => n.sequence_number.value(),
            _ => 0,
        }
    }

    #[test]
    fn test_events_delivered_in_order() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        dispatcher.subscribe(EventKind::Publish, move |e| s.lock().push(sequence_of(e)));

        for seq in 1..=50 {
            dispatcher.emit(notification(seq));
        }
        assert!(dispatcher.flush(Duration::from_secs(5)));
        assert_eq!(*seen.lock(), (1..=50).collect::<Vec<_>>());
    }

    #[test]
    fn test_routing_by_kind() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        dispatcher.subscribe(EventKind::Closing, move |e| s.lock().push(e.kind()));

        dispatcher.emit(notification(1));
        dispatcher.emit(SessionEvent::Closing {
            delete_subscriptions: true,
        });
        assert!(dispatcher.flush(Duration::from_secs(5)));
        assert_eq!(*seen.lock(), vec![EventKind::Closing]);
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        dispatcher.subscribe(EventKind::Publish, |_| panic!("observer failure"));
        let s = Arc::clone(&seen);
        dispatcher.subscribe(EventKind::Publish, move |e| s.lock().push(sequence_of(e)));

        dispatcher.emit(notification(1));
        dispatcher.emit(notification(2));
        assert!(dispatcher.flush(Duration::from_secs(5)));
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_unsubscribe() {
        let dispatcher = EventDispatcher::new();
        let id = dispatcher.subscribe(EventKind::Publish, |_| {});
        assert_eq!(dispatcher.observer_count(EventKind::Publish), 1);
        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        assert_eq!(dispatcher.observer_count(EventKind::Publish), 0);
    }

    #[test]
    fn test_subscription_delivery_shares_ordering() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        dispatcher.subscribe(EventKind::Publish, move |_| s.lock().push("session"));
        let s = Arc::clone(&seen);
        let sub_observer: SubscriptionObserver = Arc::new(move |event: &SubscriptionEvent| {
            if matches!(event, SubscriptionEvent::Deleted) {
                s.lock().push("subscription");
            }
        });

        dispatcher.emit(notification(1));
        dispatcher.deliver(
            vec![(ObserverId::next(), sub_observer)],
            SubscriptionEvent::Deleted,
        );
        dispatcher.emit(notification(2));
        assert!(dispatcher.flush(Duration::from_secs(5)));
        assert_eq!(*seen.lock(), vec!["session", "subscription", "session"]);
    }

    #[test]
    fn test_clone_observers_is_independent() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe(EventKind::StateChanged, |_| {});
        dispatcher.subscribe(EventKind::Publish, |_| {});

        let copy = dispatcher.clone_observers();
        assert_eq!(copy.total_observer_count(), 2);

        copy.subscribe(EventKind::Closing, |_| {});
        assert_eq!(copy.total_observer_count(), 3);
        assert_eq!(dispatcher.total_observer_count(), 2);
    }

    #[test]
    fn test_flush_from_observer_does_not_deadlock() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let flushed = Arc::new(Mutex::new(None));

        let d = Arc::clone(&dispatcher);
        let f = Arc::clone(&flushed);
        dispatcher.subscribe(EventKind::Closing, move |_| {
            *f.lock() = Some(d.flush(Duration::from_secs(1)));
        });

        dispatcher.emit(SessionEvent::Closing {
            delete_subscriptions: false,
        });
        assert!(dispatcher.flush(Duration::from_secs(5)));
        assert_eq!(*flushed.lock(), Some(true));
    }

    #[test]
    fn test_data_loss_count() {
        let event = DataLossEvent {
            subscription_id: SubscriptionId::new(3),
            lost: vec![
                LostRange {
                    first: SequenceNumber::new(2),
                    last: SequenceNumber::new(4),
                },
                LostRange {
                    first: SequenceNumber::new(9),
                    last: SequenceNumber::new(9),
                },
            ],
        };
        assert_eq!(event.count(), 4);
    }
}
