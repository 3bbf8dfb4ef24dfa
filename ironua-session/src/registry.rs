/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Subscription registry.
//!
//! The registry is the session's authoritative list of subscriptions. Each entry
//! owns the subscription's settings, its [`SequenceWindow`] and its observers.
//! The publish pipeline reads the count for sizing, feeds received sequence
//! numbers through [`SubscriptionRegistry::observe`] and drains acknowledgements;
//! the reconnect controller re-keys entries when subscriptions are recreated.

use crate::events::{ObserverId, SubscriptionEvent, SubscriptionObserver};
use crate::sequence::{SequenceThresholds, SequenceWindow, WindowUpdate};
use ironua_core::error::SessionError;
use ironua_core::notification::SubscriptionAcknowledgement;
use ironua_core::types::{SequenceNumber, SubscriptionId, SubscriptionSettings};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::debug;

/// Observers attached to one subscription.
pub type SubscriptionObservers = Vec<(ObserverId, SubscriptionObserver)>;

/// A subscription attached to the session.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    settings: SubscriptionSettings,
    window: SequenceWindow,
    observers: SubscriptionObservers,
}

impl Subscription {
    /// Creates a subscription with an empty sequence window.
    #[must_use]
    pub fn new(id: SubscriptionId, settings: SubscriptionSettings) -> Self {
        Self {
            id,
            settings,
            window: SequenceWindow::new(),
            observers: Vec::new(),
        }
    }

    /// Creates a subscription from a template, once the server assigned `id`.
    #[must_use]
    pub fn from_template(id: SubscriptionId, template: SubscriptionTemplate) -> Self {
        Self {
            id,
            settings: template.settings,
            window: SequenceWindow::new(),
            observers: template.observers,
        }
    }

    /// Returns the server-assigned id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns the settings the subscription was created with.
    #[must_use]
    pub const fn settings(&self) -> &SubscriptionSettings {
        &self.settings
    }

    /// Returns the sequence window.
    #[must_use]
    pub const fn window(&self) -> &SequenceWindow {
        &self.window
    }

    /// Returns the registered observers.
    #[must_use]
    pub fn observers(&self) -> &[(ObserverId, SubscriptionObserver)] {
        &self.observers
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("window", &self.window)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// A subscription that has not been created on a server yet.
#[derive(Clone, Default)]
pub struct SubscriptionTemplate {
    /// Settings to create the subscription with.
    pub settings: SubscriptionSettings,
    /// Observers to attach once created.
    pub observers: SubscriptionObservers,
}

impl SubscriptionTemplate {
    /// Creates a template without observers.
    #[must_use]
    pub fn new(settings: SubscriptionSettings) -> Self {
        Self {
            settings,
            observers: Vec::new(),
        }
    }

    /// Attaches an observer.
    #[must_use]
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&SubscriptionEvent) + Send + Sync + 'static,
    {
        self.observers.push((ObserverId::next(), Arc::new(observer)));
        self
    }
}

impl fmt::Debug for SubscriptionTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionTemplate")
            .field("settings", &self.settings)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Point-in-time description of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Server-assigned id.
    pub id: SubscriptionId,
    /// Creation settings.
    pub settings: SubscriptionSettings,
    /// Last acknowledged sequence number.
    pub last_acked: SequenceNumber,
    /// Numbers currently missing above `last_acked`.
    pub missing: Vec<SequenceNumber>,
    /// Acknowledgements waiting for the next publish request.
    pub pending_acks: usize,
    /// Number of attached observers.
    pub observer_count: usize,
}

impl From<&Subscription> for SubscriptionInfo {
    fn from(sub: &Subscription) -> Self {
        Self {
            id: sub.id,
            settings: sub.settings.clone(),
            last_acked: sub.window.last_acked(),
            missing: sub.window.missing(),
            pending_acks: sub.window.pending_ack_count(),
            observer_count: sub.observers.len(),
        }
    }
}

/// Result of [`SubscriptionRegistry::observe`].
pub struct Observation {
    /// Window classification and side effects.
    pub update: WindowUpdate,
    /// Observers to notify, snapshotted under the same lock.
    pub observers: SubscriptionObservers,
}

/// Authoritative set of the session's subscriptions.
pub struct SubscriptionRegistry {
    entries: RwLock<BTreeMap<SubscriptionId, Subscription>>,
    thresholds: SequenceThresholds,
    version: AtomicU64,
    changed: Notify,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(thresholds: SequenceThresholds) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            thresholds,
            version: AtomicU64::new(0),
            changed: Notify::new(),
        }
    }

    /// Returns the sequence thresholds applied to every subscription.
    #[must_use]
    pub const fn thresholds(&self) -> &SequenceThresholds {
        &self.thresholds
    }

    /// Attaches a subscription.
    ///
    /// # Errors
    /// Returns `SessionError::DuplicateSubscription` if the id is already attached.
    pub fn add(&self, subscription: Subscription) -> Result<(), SessionError> {
        let id = subscription.id;
        {
            let mut entries = self.entries.write();
            if entries.contains_key(&id) {
                return Err(SessionError::DuplicateSubscription(id));
            }
            entries.insert(id, subscription);
        }
        debug!(subscription = %id, "subscription added");
        self.bump();
        Ok(())
    }

    /// Detaches a subscription.
    ///
    /// # Errors
    /// Returns `SessionError::SubscriptionNotFound` if the id is not attached.
    pub fn remove(&self, id: SubscriptionId) -> Result<Subscription, SessionError> {
        let removed = self
            .entries
            .write()
            .remove(&id)
            .ok_or(SessionError::SubscriptionNotFound(id))?;
        debug!(subscription = %id, "subscription removed");
        self.bump();
        Ok(removed)
    }

    /// Detaches every subscription.
    pub fn clear(&self) -> Vec<Subscription> {
        let drained: Vec<Subscription> = std::mem::take(&mut *self.entries.write())
            .into_values()
            .collect();
        if !drained.is_empty() {
            self.bump();
        }
        drained
    }

    /// Returns a description of one subscription.
    #[must_use]
    pub fn get(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.entries.read().get(&id).map(SubscriptionInfo::from)
    }

    /// Returns true if the id is attached.
    #[must_use]
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Describes every subscription, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<SubscriptionInfo> {
        self.entries
            .read()
            .values()
            .map(SubscriptionInfo::from)
            .collect()
    }

    /// Returns the attached ids, ordered.
    #[must_use]
    pub fn ids(&self) -> Vec<SubscriptionId> {
        self.entries.read().keys().copied().collect()
    }

    /// Returns the number of attached subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no subscription is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns a counter that changes whenever the set of subscriptions changes.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Waits until the set of subscriptions changes.
    ///
    /// A change that happened while nobody was waiting completes the next call
    /// immediately.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Feeds a received sequence number into the subscription's window.
    ///
    /// Returns `None` if the subscription is not attached.
    pub fn observe(
        &self,
        id: SubscriptionId,
        sequence_number: SequenceNumber,
    ) -> Option<Observation> {
        let mut entries = self.entries.write();
        let sub = entries.get_mut(&id)?;
        let update = sub.window.accept(sequence_number, &self.thresholds);
        Some(Observation {
            update,
            observers: sub.observers.clone(),
        })
    }

    /// Gives up on a missing number.
    ///
    /// Returns the observers to notify if the number was actually missing.
    pub fn mark_lost(
        &self,
        id: SubscriptionId,
        sequence_number: SequenceNumber,
    ) -> Option<SubscriptionObservers> {
        let mut entries = self.entries.write();
        let sub = entries.get_mut(&id)?;
        sub.window
            .mark_lost(sequence_number)
            .then(|| sub.observers.clone())
    }

    /// Drains pending acknowledgements across all subscriptions.
    pub fn take_acks(&self) -> Vec<SubscriptionAcknowledgement> {
        self.entries
            .write()
            .values_mut()
            .flat_map(|sub| sub.window.take_acks(sub.id))
            .collect()
    }

    /// Puts acknowledgements back after their request failed.
    ///
    /// Acknowledgements for detached subscriptions are dropped.
    pub fn restore_acks(&self, acks: &[SubscriptionAcknowledgement]) {
        if acks.is_empty() {
            return;
        }
        let mut entries = self.entries.write();
        for ack in acks {
            if let Some(sub) = entries.get_mut(&ack.subscription_id) {
                sub.window.restore_acks([ack.sequence_number]);
            }
        }
    }

    /// Re-keys a subscription recreated on the server under `new_id`.
    ///
    /// The sequence window starts over; observers are kept.
    ///
    /// # Errors
    /// Returns `SessionError::SubscriptionNotFound` if `old_id` is not attached,
    /// or `SessionError::DuplicateSubscription` if `new_id` already is.
    pub fn replace_id(
        &self,
        old_id: SubscriptionId,
        new_id: SubscriptionId,
    ) -> Result<SubscriptionObservers, SessionError> {
        let observers = {
            let mut entries = self.entries.write();
            if old_id != new_id && entries.contains_key(&new_id) {
                return Err(SessionError::DuplicateSubscription(new_id));
            }
            let mut sub = entries
                .remove(&old_id)
                .ok_or(SessionError::SubscriptionNotFound(old_id))?;
            sub.id = new_id;
            sub.window.reset();
            let observers = sub.observers.clone();
            entries.insert(new_id, sub);
            observers
        };
        debug!(old = %old_id, new = %new_id, "subscription re-keyed");
        self.bump();
        Ok(observers)
    }

    /// Resets a subscription's sequence window.
    ///
    /// # Errors
    /// Returns `SessionError::SubscriptionNotFound` if the id is not attached.
    pub fn reset_window(&self, id: SubscriptionId) -> Result<(), SessionError> {
        self.entries
            .write()
            .get_mut(&id)
            .map(|sub| sub.window.reset())
            .ok_or(SessionError::SubscriptionNotFound(id))
    }

    /// Returns a copy of a subscription's sequence window.
    #[must_use]
    pub fn window(&self, id: SubscriptionId) -> Option<SequenceWindow> {
        self.entries.read().get(&id).map(|sub| sub.window.clone())
    }

    /// Returns the settings of a subscription.
    #[must_use]
    pub fn settings(&self, id: SubscriptionId) -> Option<SubscriptionSettings> {
        self.entries.read().get(&id).map(|sub| sub.settings.clone())
    }

    /// Duplicates every subscription as a template for another session.
    ///
    /// Observers are carried over only when `copy_observers` is set.
    #[must_use]
    pub fn clone_subscriptions(&self, copy_observers: bool) -> Vec<SubscriptionTemplate> {
        self.entries
            .read()
            .values()
            .map(|sub| SubscriptionTemplate {
                settings: sub.settings.clone(),
                observers: if copy_observers {
                    sub.observers.clone()
                } else {
                    Vec::new()
                },
            })
            .collect()
    }

    /// Attaches an observer to one subscription.
    ///
    /// # Errors
    /// Returns `SessionError::SubscriptionNotFound` if the id is not attached.
    pub fn subscribe(
        &self,
        id: SubscriptionId,
        observer: SubscriptionObserver,
    ) -> Result<ObserverId, SessionError> {
        let mut entries = self.entries.write();
        let sub = entries
            .get_mut(&id)
            .ok_or(SessionError::SubscriptionNotFound(id))?;
        let observer_id = ObserverId::next();
        sub.observers.push((observer_id, observer));
        Ok(observer_id)
    }

    /// Detaches an observer from whichever subscription holds it.
    pub fn unsubscribe(&self, observer_id: ObserverId) -> bool {
        let mut entries = self.entries.write();
        for sub in entries.values_mut() {
            let before = sub.observers.len();
            sub.observers.retain(|(id, _)| *id != observer_id);
            if sub.observers.len() != before {
                return true;
            }
        }
        false
    }

    /// Returns the observers of one subscription.
    #[must_use]
    pub fn observers(&self, id: SubscriptionId) -> SubscriptionObservers {
        self.entries
            .read()
            .get(&id)
            .map(|sub| sub.observers.clone())
            .unwrap_or_default()
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_one();
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.ids())
            .field("version", &self.version())
            .finish()
    }
}
