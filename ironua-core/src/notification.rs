/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Notification and acknowledgement types.
//!
//! Notification payloads are opaque [`Bytes`]; decoding them into data-change or
//! event records is the application's concern.

use crate::error::ServiceFault;
use crate::types::{SequenceNumber, SubscriptionId};
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A sequenced notification delivered for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    /// Subscription that produced the notification.
    pub subscription_id: SubscriptionId,
    /// Sequence number within the subscription.
    pub sequence_number: SequenceNumber,
    /// Time the server published the notification.
    pub publish_time: DateTime<Utc>,
    /// Encoded notification data.
    pub payload: Bytes,
}

impl NotificationMessage {
    /// Creates a data notification published now.
    #[must_use]
    pub fn new(
        subscription_id: SubscriptionId,
        sequence_number: SequenceNumber,
        payload: Bytes,
    ) -> Self {
        Self {
            subscription_id,
            sequence_number,
            publish_time: Utc::now(),
            payload,
        }
    }

    /// Creates a keep-alive notification.
    ///
    /// `next_sequence_number` is the number the next data notification will carry.
    #[must_use]
    pub fn keep_alive(
        subscription_id: SubscriptionId,
        next_sequence_number: SequenceNumber,
    ) -> Self {
        Self::new(subscription_id, next_sequence_number, Bytes::new())
    }

    /// Returns true if the notification carries no data.
    ///
    /// Keep-alives do not consume a sequence number and are never acknowledged.
    #[inline]
    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A completed publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResponse {
    /// The delivered notification.
    pub notification: NotificationMessage,
    /// Sequence numbers the server still retains for republish.
    pub available_sequence_numbers: Vec<SequenceNumber>,
    /// Whether the server has more notifications queued for the subscription.
    pub more_notifications: bool,
}

impl PublishResponse {
    /// Creates a response carrying a single notification.
    #[must_use]
    pub fn new(notification: NotificationMessage) -> Self {
        Self {
            notification,
            available_sequence_numbers: Vec::new(),
            more_notifications: false,
        }
    }

    /// Returns the subscription the response belongs to.
    #[inline]
    #[must_use]
    pub fn subscription_id(&self) -> SubscriptionId {
        self.notification.subscription_id
    }
}

/// Acknowledgement of one received notification, piggybacked on a publish request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionAcknowledgement {
    /// Subscription the notification belongs to.
    pub subscription_id: SubscriptionId,
    /// Acknowledged sequence number.
    pub sequence_number: SequenceNumber,
}

impl SubscriptionAcknowledgement {
    /// Creates a new acknowledgement.
    #[must_use]
    pub const fn new(subscription_id: SubscriptionId, sequence_number: SequenceNumber) -> Self {
        Self {
            subscription_id,
            sequence_number,
        }
    }
}

/// Per-subscription result of a transfer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    /// Subscription the result refers to.
    pub subscription_id: SubscriptionId,
    /// `Ok` if the subscription now belongs to the requesting session.
    pub result: Result<(), ServiceFault>,
}

impl TransferResult {
    /// Creates a successful result.
    #[must_use]
    pub const fn transferred(subscription_id: SubscriptionId) -> Self {
        Self {
            subscription_id,
            result: Ok(()),
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub const fn rejected(subscription_id: SubscriptionId, fault: ServiceFault) -> Self {
        Self {
            subscription_id,
            result: Err(fault),
        }
    }

    /// Returns true if the subscription was transferred.
    #[must_use]
    pub const fn is_transferred(&self) -> bool {
        self.result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive_detection() {
        let sub = SubscriptionId::new(1);
        let keep_alive = NotificationMessage::keep_alive(sub, SequenceNumber::new(5));
        assert!(keep_alive.is_keep_alive());

        let data = NotificationMessage::new(sub, SequenceNumber::new(5), Bytes::from_static(b"x"));
        assert!(!data.is_keep_alive());
    }

    #[test]
    fn test_publish_response_subscription() {
        let notification =
            NotificationMessage::new(SubscriptionId::new(9), SequenceNumber::new(1), Bytes::new());
        let response = PublishResponse::new(notification);
        assert_eq!(response.subscription_id(), SubscriptionId::new(9));
        assert!(!response.more_notifications);
    }

    #[test]
    fn test_transfer_result() {
        let ok = TransferResult::transferred(SubscriptionId::new(1));
        let err = TransferResult::rejected(
            SubscriptionId::new(2),
            ServiceFault::SubscriptionIdInvalid(SubscriptionId::new(2)),
        );
        assert!(ok.is_transferred());
        assert!(!err.is_transferred());
    }
}
