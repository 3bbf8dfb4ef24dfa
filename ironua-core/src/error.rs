/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Error types for the IronUA session engine.
//!
//! This module provides a unified error hierarchy using `thiserror`:
//! - [`ServiceFault`]: a failed call on the RPC layer, classified by [`FaultSeverity`]
//! - [`SessionError`]: errors raised by the session-continuity components
//! - [`ConfigError`]: invalid session configuration
//! - [`UaError`]: the top-level error wrapping all of the above

use crate::types::SubscriptionId;
use thiserror::Error;

/// Result type alias using [`UaError`] as the error type.
pub type Result<T> = std::result::Result<T, UaError>;

/// Top-level error type for all IronUA operations.
#[derive(Debug, Error)]
pub enum UaError {
    /// Error in session layer operations.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// A service call failed on the RPC layer.
    #[error("service fault: {0}")]
    Fault(#[from] ServiceFault),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// How a [`ServiceFault`] affects the session that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultSeverity {
    /// A single request failed; the channel is still usable.
    Transient,
    /// The session is no longer usable as-is and must be recovered.
    SessionFatal,
    /// The server rejected the client's identity; recovery is impossible.
    Unrecoverable,
}

/// A failed call on the RPC layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceFault {
    /// The call did not complete within its deadline.
    #[error("request timed out")]
    Timeout,

    /// The underlying connection was closed while the call was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// The secure channel was closed by the server.
    #[error("secure channel closed")]
    SecureChannelClosed,

    /// The server does not know the session.
    #[error("session id invalid")]
    SessionIdInvalid,

    /// The session was closed on the server.
    #[error("session closed")]
    SessionClosed,

    /// The session has not been activated.
    #[error("session not activated")]
    SessionNotActivated,

    /// The server has more publish requests queued than it is willing to hold.
    #[error("too many publish requests")]
    TooManyPublishRequests,

    /// The session has no subscriptions to publish for.
    #[error("no subscription")]
    NoSubscription,

    /// The subscription id is not known to the server.
    #[error("subscription {0} invalid")]
    SubscriptionIdInvalid(SubscriptionId),

    /// The requested notification is no longer available for republish.
    #[error("message not available")]
    MessageNotAvailable,

    /// The user identity token was rejected.
    #[error("identity token rejected: {0}")]
    IdentityTokenRejected(String),

    /// The client certificate was rejected.
    #[error("certificate invalid: {0}")]
    CertificateInvalid(String),

    /// The server reported a protocol violation that invalidates the session.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Any other status reported by the server.
    #[error("status 0x{code:08X}: {reason}")]
    Other {
        /// Raw status code.
        code: u32,
        /// Human-readable reason.
        reason: String,
    },
}

impl ServiceFault {
    /// Classifies the fault for the session's error handling policy.
    #[must_use]
    pub const fn severity(&self) -> FaultSeverity {
        match self {
            Self::SecureChannelClosed
            | Self::SessionIdInvalid
            | Self::SessionClosed
            | Self::SessionNotActivated
            | Self::ProtocolViolation(_) => FaultSeverity::SessionFatal,
            Self::IdentityTokenRejected(_) | Self::CertificateInvalid(_) => {
                FaultSeverity::Unrecoverable
            }
            Self::Timeout
            | Self::ConnectionClosed
            | Self::TooManyPublishRequests
            | Self::NoSubscription
            | Self::SubscriptionIdInvalid(_)
            | Self::MessageNotAvailable
            | Self::Other { .. } => FaultSeverity::Transient,
        }
    }

    /// Returns true if the fault means the server no longer knows the session.
    #[must_use]
    pub const fn is_session_unknown(&self) -> bool {
        matches!(
            self,
            Self::SessionIdInvalid | Self::SessionClosed | Self::SessionNotActivated
        )
    }

    /// Returns true if the session must be recovered after this fault.
    #[inline]
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(self.severity(), FaultSeverity::SessionFatal)
    }

    /// Returns true if the session cannot be recovered after this fault.
    #[inline]
    #[must_use]
    pub const fn is_unrecoverable(&self) -> bool {
        matches!(self.severity(), FaultSeverity::Unrecoverable)
    }
}

/// Errors raised by the session-continuity components.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session is not in the correct state for the operation.
    #[error("invalid session state: expected {expected}, current {current}")]
    InvalidState {
        /// Expected state for the operation.
        expected: String,
        /// Current session state.
        current: String,
    },

    /// The session has been closed locally.
    #[error("session closed")]
    Closed,

    /// The session failed permanently and must be recreated by the application.
    #[error("session failed: {0}")]
    Failed(ServiceFault),

    /// A bounded operation did not finish in time.
    #[error("{operation} timed out after {elapsed_ms} milliseconds")]
    Timeout {
        /// Name of the operation.
        operation: &'static str,
        /// Elapsed time in milliseconds.
        elapsed_ms: u64,
    },

    /// The subscription is not attached to this session.
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    /// The subscription is already attached to this session.
    #[error("subscription already registered: {0}")]
    DuplicateSubscription(SubscriptionId),

    /// A background task of the session is no longer running.
    #[error("session task stopped: {0}")]
    TaskStopped(&'static str),
}

/// Invalid session configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required field was not set.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A field has a value outside its accepted range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
