/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Adapter for synchronous RPC layers.
//!
//! Service stacks that only offer blocking calls implement
//! [`BlockingSessionChannel`]; [`BlockingAdapter`] turns them into a
//! [`SessionChannel`] by running each call on tokio's blocking pool.

use crate::traits::SessionChannel;
use async_trait::async_trait;
use ironua_core::error::ServiceFault;
use ironua_core::notification::{
    NotificationMessage, PublishResponse, SubscriptionAcknowledgement, TransferResult,
};
use ironua_core::types::{
    Credentials, SequenceNumber, ServerState, SessionId, SessionIdentity, SubscriptionId,
    SubscriptionSettings,
};
use std::sync::Arc;
use std::time::Duration;

/// Status code reported when a blocking call panics or is cancelled.
pub const BAD_INTERNAL_ERROR: u32 = 0x8002_0000;

/// Synchronous counterpart of [`SessionChannel`].
pub trait BlockingSessionChannel: Send + Sync + 'static {
    /// See [`SessionChannel::connect`].
    fn connect(&self) -> Result<(), ServiceFault>;

    /// See [`SessionChannel::create_session`].
    fn create_session(
        &self,
        session_name: &str,
        requested_timeout: Duration,
    ) -> Result<SessionIdentity, ServiceFault>;

    /// See [`SessionChannel::activate`].
    fn activate(
        &self,
        session_id: &SessionId,
        credentials: &Credentials,
    ) -> Result<(), ServiceFault>;

    /// See [`SessionChannel::publish`].
    fn publish(
        &self,
        acknowledgements: &[SubscriptionAcknowledgement],
    ) -> Result<PublishResponse, ServiceFault>;

    /// See [`SessionChannel::republish`].
    fn republish(
        &self,
        subscription_id: SubscriptionId,
        sequence_number: SequenceNumber,
    ) -> Result<NotificationMessage, ServiceFault>;

    /// See [`SessionChannel::create_subscription`].
    fn create_subscription(
        &self,
        settings: &SubscriptionSettings,
    ) -> Result<SubscriptionId, ServiceFault>;

    /// See [`SessionChannel::delete_subscriptions`].
    fn delete_subscriptions(&self, ids: &[SubscriptionId]) -> Result<(), ServiceFault>;

    /// See [`SessionChannel::transfer_subscriptions`].
    fn transfer_subscriptions(
        &self,
        ids: &[SubscriptionId],
        send_initial_values: bool,
    ) -> Result<Vec<TransferResult>, ServiceFault>;

    /// See [`SessionChannel::read_server_state`].
    fn read_server_state(&self) -> Result<ServerState, ServiceFault>;

    /// See [`SessionChannel::close`].
    fn close(&self, delete_subscriptions: bool) -> Result<(), ServiceFault>;
}

/// Wraps a [`BlockingSessionChannel`] as an asynchronous [`SessionChannel`].
#[derive(Debug)]
pub struct BlockingAdapter<C> {
    inner: Arc<C>,
}

impl<C: BlockingSessionChannel> BlockingAdapter<C> {
    /// Creates a new adapter around a blocking channel.
    #[must_use]
    pub fn new(inner: C) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Returns the wrapped channel.
    #[must_use]
    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn run<T, F>(&self, call: F) -> Result<T, ServiceFault>
    where
        T: Send + 'static,
        F: FnOnce(&C) -> Result<T, ServiceFault> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        match tokio::task::spawn_blocking(move || call(&inner)).await {
            Ok(result) => result,
            Err(err) => Err(ServiceFault::Other {
                code: BAD_INTERNAL_ERROR,
                reason: err.to_string(),
            }),
        }
    }
}

#[async_trait]
impl<C: BlockingSessionChannel> SessionChannel for BlockingAdapter<C> {
    async fn connect(&self) -> Result<(), ServiceFault> {
        self.run(|c| c.connect()).await
    }

    async fn create_session(
        &self,
        session_name: &str,
        requested_timeout: Duration,
    ) -> Result<SessionIdentity, ServiceFault> {
        let name = session_name.to_owned();
        self.run(move |c| c.create_session(&name, requested_timeout))
            .await
    }

    async fn activate(
        &self,
        session_id: &SessionId,
        credentials: &Credentials,
    ) -> Result<(), ServiceFault> {
        let id = session_id.clone();
        let credentials = credentials.clone();
        self.run(move |c| c.activate(&id, &credentials)).await
    }

    async fn publish(
        &self,
        acknowledgements: &[SubscriptionAcknowledgement],
    ) -> Result<PublishResponse, ServiceFault> {
        let acks = acknowledgements.to_vec();
        self.run(move |c| c.publish(&acks)).await
    }

    async fn republish(
        &self,
        subscription_id: SubscriptionId,
        sequence_number: SequenceNumber,
    ) -> Result<NotificationMessage, ServiceFault> {
        self.run(move |c| c.republish(subscription_id, sequence_number))
            .await
    }

    async fn create_subscription(
        &self,
        settings: &SubscriptionSettings,
    ) -> Result<SubscriptionId, ServiceFault> {
        let settings = settings.clone();
        self.run(move |c| c.create_subscription(&settings)).await
    }

    async fn delete_subscriptions(&self, ids: &[SubscriptionId]) -> Result<(), ServiceFault> {
        let ids = ids.to_vec();
        self.run(move |c| c.delete_subscriptions(&ids)).await
    }

    async fn transfer_subscriptions(
        &self,
        ids: &[SubscriptionId],
        send_initial_values: bool,
    ) -> Result<Vec<TransferResult>, ServiceFault> {
        let ids = ids.to_vec();
        self.run(move |c| c.transfer_subscriptions(&ids, send_initial_values))
            .await
    }

    async fn read_server_state(&self) -> Result<ServerState, ServiceFault> {
        self.run(|c| c.read_server_state()).await
    }

    async fn close(&self, delete_subscriptions: bool) -> Result<(), ServiceFault> {
        self.run(move |c| c.close(delete_subscriptions)).await
    }
}
