/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! In-memory loopback channel.
//!
//! [`LoopbackChannel`] plays the server side of a session without any network.
//! Publish requests park until a response is scripted with one of the `push_*`
//! methods, which makes it suitable for tests and demos that need to control
//! exactly when and in which order notifications arrive. Faults can be injected
//! for every service call.

use crate::traits::SessionChannel;
use async_trait::async_trait;
use bytes::Bytes;
use ironua_core::error::ServiceFault;
use ironua_core::notification::{
    NotificationMessage, PublishResponse, SubscriptionAcknowledgement, TransferResult,
};
use ironua_core::types::{
    AuthToken, Credentials, SequenceNumber, ServerState, SessionId, SessionIdentity,
    SubscriptionId, SubscriptionSettings,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

type PublishOutcome = Result<PublishResponse, ServiceFault>;

/// Scripted in-memory server.
#[derive(Debug)]
pub struct LoopbackChannel {
    responses_tx: mpsc::UnboundedSender<PublishOutcome>,
    responses_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PublishOutcome>>,
    state: Mutex<LoopbackState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    next_session: AtomicU64,
    next_subscription: AtomicU32,
}

#[derive(Debug)]
struct LoopbackState {
    current_session: Option<SessionId>,
    session_valid: bool,
    connect_fault: Option<ServiceFault>,
    connect_delay: Option<Duration>,
    activate_fault: Option<ServiceFault>,
    create_subscription_fault: Option<ServiceFault>,
    transfer_rejects: HashSet<SubscriptionId>,
    retained: HashMap<(SubscriptionId, SequenceNumber), NotificationMessage>,
    server_state: Result<ServerState, ServiceFault>,
    acknowledgements: Vec<Vec<SubscriptionAcknowledgement>>,
    deleted: Vec<SubscriptionId>,
    calls: Vec<&'static str>,
    closed: Option<bool>,
}

/// Decrements the in-flight counter even when a publish future is dropped.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LoopbackChannel {
    /// Creates a new loopback channel with no session.
    #[must_use]
    pub fn new() -> Self {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        Self {
            responses_tx,
            responses_rx: tokio::sync::Mutex::new(responses_rx),
            state: Mutex::new(LoopbackState {
                current_session: None,
                session_valid: false,
                connect_fault: None,
                connect_delay: None,
                activate_fault: None,
                create_subscription_fault: None,
                transfer_rejects: HashSet::new(),
                retained: HashMap::new(),
                server_state: Ok(ServerState::Running),
                acknowledgements: Vec::new(),
                deleted: Vec::new(),
                calls: Vec::new(),
                closed: None,
            }),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            next_session: AtomicU64::new(1),
            next_subscription: AtomicU32::new(1),
        }
    }

    /// Completes the next parked publish request with a data notification.
    pub fn push_notification(
        &self,
        subscription_id: SubscriptionId,
        sequence_number: u32,
        payload: &'static [u8],
    ) {
        let notification = NotificationMessage::new(
            subscription_id,
            SequenceNumber::new(sequence_number),
            Bytes::from_static(payload),
        );
        self.push_response(PublishResponse::new(notification));
    }

    /// Completes the next parked publish request with a keep-alive.
    pub fn push_keep_alive(&self, subscription_id: SubscriptionId, next_sequence_number: u32) {
        let notification = NotificationMessage::keep_alive(
            subscription_id,
            SequenceNumber::new(next_sequence_number),
        );
        self.push_response(PublishResponse::new(notification));
    }

    /// Completes the next parked publish request with the given response.
    pub fn push_response(&self, response: PublishResponse) {
        let _ = self.responses_tx.send(Ok(response));
    }

    /// Fails the next parked publish request.
    pub fn push_fault(&self, fault: ServiceFault) {
        let _ = self.responses_tx.send(Err(fault));
    }

    /// Keeps a notification available for republish.
    pub fn retain(&self, notification: NotificationMessage) {
        self.state.lock().retained.insert(
            (notification.subscription_id, notification.sequence_number),
            notification,
        );
    }

    /// Makes the server forget the current session.
    pub fn drop_session(&self) {
        self.state.lock().session_valid = false;
    }

    /// Makes `connect` fail with the given fault (or succeed with `None`).
    pub fn set_connect_fault(&self, fault: Option<ServiceFault>) {
        self.state.lock().connect_fault = fault;
    }

    /// Delays every `connect` call.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state.lock().connect_delay = delay;
    }

    /// Makes `activate` fail with the given fault (or behave normally with `None`).
    pub fn set_activate_fault(&self, fault: Option<ServiceFault>) {
        self.state.lock().activate_fault = fault;
    }

    /// Makes `create_subscription` fail with the given fault.
    pub fn set_create_subscription_fault(&self, fault: Option<ServiceFault>) {
        self.state.lock().create_subscription_fault = fault;
    }

    /// Makes transfers of the given subscription fail.
    pub fn reject_transfer(&self, subscription_id: SubscriptionId) {
        self.state.lock().transfer_rejects.insert(subscription_id);
    }

    /// Sets the outcome of `read_server_state`.
    pub fn set_server_state(&self, state: Result<ServerState, ServiceFault>) {
        self.state.lock().server_state = state;
    }

    /// Returns the acknowledgements carried by each publish request, in issue order.
    #[must_use]
    pub fn acknowledgements(&self) -> Vec<Vec<SubscriptionAcknowledgement>> {
        self.state.lock().acknowledgements.clone()
    }

    /// Returns every acknowledgement received, flattened.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<SubscriptionAcknowledgement> {
        self.state
            .lock()
            .acknowledgements
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    /// Returns the number of publish requests currently parked.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Returns the highest number of publish requests parked at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Returns the number of publish requests received so far.
    #[must_use]
    pub fn publish_count(&self) -> usize {
        self.state.lock().acknowledgements.len()
    }

    /// Returns the names of the service calls received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    /// Returns the number of times a service call was received.
    #[must_use]
    pub fn call_count(&self, name: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == name).count()
    }

    /// Returns the subscriptions deleted so far.
    #[must_use]
    pub fn deleted_subscriptions(&self) -> Vec<SubscriptionId> {
        self.state.lock().deleted.clone()
    }

    /// Returns the `delete_subscriptions` flag of the last close, if any.
    #[must_use]
    pub fn closed_with(&self) -> Option<bool> {
        self.state.lock().closed
    }

    /// Returns the session the server currently knows.
    #[must_use]
    pub fn current_session(&self) -> Option<SessionId> {
        self.state.lock().current_session.clone()
    }

    fn record(&self, call: &'static str) {
        trace!(call, "loopback call");
        self.state.lock().calls.push(call);
    }
}

impl Default for LoopbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionChannel for LoopbackChannel {
    async fn connect(&self) -> Result<(), ServiceFault> {
        self.record("connect");
        let (delay, fault) = {
            let state = self.state.lock();
            (state.connect_delay, state.connect_fault.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        fault.map_or(Ok(()), Err)
    }

    async fn create_session(
        &self,
        session_name: &str,
        requested_timeout: Duration,
    ) -> Result<SessionIdentity, ServiceFault> {
        self.record("create_session");
        let n = self.next_session.fetch_add(1, Ordering::SeqCst);
        let session_id = SessionId::new(format!("{session_name}-{n}"));

        let mut state = self.state.lock();
        state.current_session = Some(session_id.clone());
        state.session_valid = true;

        Ok(SessionIdentity {
            session_id,
            auth_token: AuthToken::new(format!("token-{n}")),
            revised_timeout: requested_timeout,
        })
    }

    async fn activate(
        &self,
        session_id: &SessionId,
        _credentials: &Credentials,
    ) -> Result<(), ServiceFault> {
        self.record("activate");
        let state = self.state.lock();
        if let Some(fault) = &state.activate_fault {
            return Err(fault.clone());
        }
        if state.session_valid && state.current_session.as_ref() == Some(session_id) {
            Ok(())
        } else {
            Err(ServiceFault::SessionIdInvalid)
        }
    }

    async fn publish(
        &self,
        acknowledgements: &[SubscriptionAcknowledgement],
    ) -> Result<PublishResponse, ServiceFault> {
        self.state
            .lock()
            .acknowledgements
            .push(acknowledgements.to_vec());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let mut responses = self.responses_rx.lock().await;
        responses
            .recv()
            .await
            .unwrap_or(Err(ServiceFault::ConnectionClosed))
    }

    async fn republish(
        &self,
        subscription_id: SubscriptionId,
        sequence_number: SequenceNumber,
    ) -> Result<NotificationMessage, ServiceFault> {
        self.record("republish");
        self.state
            .lock()
            .retained
            .get(&(subscription_id, sequence_number))
            .cloned()
            .ok_or(ServiceFault::MessageNotAvailable)
    }

    async fn create_subscription(
        &self,
        _settings: &SubscriptionSettings,
    ) -> Result<SubscriptionId, ServiceFault> {
        self.record("create_subscription");
        if let Some(fault) = self.state.lock().create_subscription_fault.clone() {
            return Err(fault);
        }
        Ok(SubscriptionId::new(
            self.next_subscription.fetch_add(1, Ordering::SeqCst),
        ))
    }

    async fn delete_subscriptions(&self, ids: &[SubscriptionId]) -> Result<(), ServiceFault> {
        self.record("delete_subscriptions");
        self.state.lock().deleted.extend_from_slice(ids);
        Ok(())
    }

    async fn transfer_subscriptions(
        &self,
        ids: &[SubscriptionId],
        _send_initial_values: bool,
    ) -> Result<Vec<TransferResult>, ServiceFault> {
        self.record("transfer_subscriptions");
        let state = self.state.lock();
        Ok(ids
            .iter()
            .map(|id| {
                if state.transfer_rejects.contains(id) {
                    TransferResult::rejected(*id, ServiceFault::SubscriptionIdInvalid(*id))
                } else {
                    TransferResult::transferred(*id)
                }
            })
            .collect())
    }

    async fn read_server_state(&self) -> Result<ServerState, ServiceFault> {
        self.record("read_server_state");
        self.state.lock().server_state.clone()
    }

    async fn close(&self, delete_subscriptions: bool) -> Result<(), ServiceFault> {
        self.record("close");
        let mut state = self.state.lock();
        state.closed = Some(delete_subscriptions);
        state.session_valid = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_loopback_session_lifecycle() {
        let channel = LoopbackChannel::new();
        channel.connect().await.unwrap();

        let identity = channel
            .create_session("plant", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(identity.session_id.as_str(), "plant-1");
        assert!(
            channel
                .activate(&identity.session_id, &Credentials::Anonymous)
                .await
                .is_ok()
        );

        channel.drop_session();
        assert_eq!(
            channel
                .activate(&identity.session_id, &Credentials::Anonymous)
                .await,
            Err(ServiceFault::SessionIdInvalid)
        );
    }

    #[tokio::test]
    async fn test_loopback_publish_parks_until_pushed() {
        let channel = Arc::new(LoopbackChannel::new());
        let sub = SubscriptionId::new(1);

        let publisher = Arc::clone(&channel);
        let pending = tokio::spawn(async move { publisher.publish(&[]).await });

        while channel.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        channel.push_notification(sub, 1, b"v");

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.notification.sequence_number.value(), 1);
        assert_eq!(channel.in_flight(), 0);
        assert_eq!(channel.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_loopback_records_acknowledgements() {
        let channel = LoopbackChannel::new();
        let ack = SubscriptionAcknowledgement::new(SubscriptionId::new(3), SequenceNumber::new(4));

        channel.push_fault(ServiceFault::Timeout);
        assert_eq!(channel.publish(&[ack]).await, Err(ServiceFault::Timeout));
        assert_eq!(channel.acknowledged(), vec![ack]);
        assert_eq!(channel.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_loopback_transfer_and_republish() {
        let channel = LoopbackChannel::new();
        let a = SubscriptionId::new(1);
        let b = SubscriptionId::new(2);
        channel.reject_transfer(b);

        let results = channel.transfer_subscriptions(&[a, b], false).await.unwrap();
        assert!(results[0].is_transferred());
        assert!(!results[1].is_transferred());

        let retained =
            NotificationMessage::new(a, SequenceNumber::new(7), Bytes::from_static(b"r"));
        channel.retain(retained.clone());
        assert_eq!(channel.republish(a, SequenceNumber::new(7)).await, Ok(retained));
        assert_eq!(
            channel.republish(a, SequenceNumber::new(8)).await,
            Err(ServiceFault::MessageNotAvailable)
        );
    }
}
