/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Service channel trait definition.
//!
//! This module defines the abstract interface the session engine uses to talk
//! to a server. Implementations own encoding, security and the socket.

use async_trait::async_trait;
use ironua_core::error::ServiceFault;
use ironua_core::notification::{
    NotificationMessage, PublishResponse, SubscriptionAcknowledgement, TransferResult,
};
use ironua_core::types::{
    Credentials, SequenceNumber, ServerState, SessionId, SessionIdentity, SubscriptionId,
    SubscriptionSettings,
};
use std::time::Duration;

/// Abstract interface for session service calls.
///
/// Every call either succeeds or fails with a [`ServiceFault`]. Calls may be
/// issued concurrently; in particular several `publish` calls are normally
/// outstanding at once and may complete in any order.
#[async_trait]
pub trait SessionChannel: Send + Sync {
    /// Establishes (or re-establishes) channel-level connectivity.
    ///
    /// # Errors
    /// Returns `ServiceFault` if the channel cannot be opened.
    async fn connect(&self) -> Result<(), ServiceFault>;

    /// Creates a new session on the server.
    ///
    /// # Arguments
    /// * `session_name` - Human-readable session name
    /// * `requested_timeout` - Requested server-side session timeout
    ///
    /// # Errors
    /// Returns `ServiceFault` if the server refuses the session.
    async fn create_session(
        &self,
        session_name: &str,
        requested_timeout: Duration,
    ) -> Result<SessionIdentity, ServiceFault>;

    /// Activates a session, binding it to the current channel.
    ///
    /// # Arguments
    /// * `session_id` - The session to activate
    /// * `credentials` - User identity to present
    ///
    /// # Errors
    /// Returns `ServiceFault` if the session is unknown or the identity is rejected.
    async fn activate(
        &self,
        session_id: &SessionId,
        credentials: &Credentials,
    ) -> Result<(), ServiceFault>;

    /// Issues one publish request, acknowledging previously received notifications.
    ///
    /// The server completes the request when a notification or keep-alive is due.
    ///
    /// # Errors
    /// Returns `ServiceFault` if the request fails.
    async fn publish(
        &self,
        acknowledgements: &[SubscriptionAcknowledgement],
    ) -> Result<PublishResponse, ServiceFault>;

    /// Requests retransmission of a retained notification.
    ///
    /// # Errors
    /// Returns `ServiceFault` if the notification is no longer available.
    async fn republish(
        &self,
        subscription_id: SubscriptionId,
        sequence_number: SequenceNumber,
    ) -> Result<NotificationMessage, ServiceFault>;

    /// Creates a subscription on the current session.
    ///
    /// # Errors
    /// Returns `ServiceFault` if the subscription cannot be created.
    async fn create_subscription(
        &self,
        settings: &SubscriptionSettings,
    ) -> Result<SubscriptionId, ServiceFault>;

    /// Deletes subscriptions from the current session.
    ///
    /// # Errors
    /// Returns `ServiceFault` if the request as a whole fails.
    async fn delete_subscriptions(&self, ids: &[SubscriptionId]) -> Result<(), ServiceFault>;

    /// Transfers subscriptions to the current session.
    ///
    /// # Arguments
    /// * `ids` - Subscriptions to transfer
    /// * `send_initial_values` - Whether the server resends current values
    ///
    /// # Errors
    /// Returns `ServiceFault` if the request as a whole fails; per-subscription
    /// failures are reported in the returned results.
    async fn transfer_subscriptions(
        &self,
        ids: &[SubscriptionId],
        send_initial_values: bool,
    ) -> Result<Vec<TransferResult>, ServiceFault>;

    /// Reads the server state; used as an explicit keep-alive.
    ///
    /// # Errors
    /// Returns `ServiceFault` if the read fails.
    async fn read_server_state(&self) -> Result<ServerState, ServiceFault>;

    /// Closes the current session.
    ///
    /// # Errors
    /// Returns `ServiceFault` if the close request fails.
    async fn close(&self, delete_subscriptions: bool) -> Result<(), ServiceFault>;
}
