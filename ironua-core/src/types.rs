/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Core types for session operations.
//!
//! This module provides the identifiers and value types shared by every
//! IronUA crate:
//! - [`SessionId`] and [`AuthToken`]: server-assigned session identity
//! - [`SubscriptionId`]: server-assigned subscription identity
//! - [`SequenceNumber`]: per-subscription notification sequence number
//! - [`SubscriptionSettings`]: the configuration a subscription is (re)created from

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Server-assigned session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new session identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Secret token authenticating requests on a session.
///
/// The token value is never printed by `Debug` or `Display`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AuthToken(String);

impl AuthToken {
    /// Creates a new authentication token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// Server-assigned subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct SubscriptionId(u32);

impl SubscriptionId {
    /// Creates a new subscription identifier.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw identifier value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for SubscriptionId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Notification sequence number.
///
/// Sequence numbers identify notifications within one subscription. The first
/// notification carries 1; 0 means "nothing received yet".
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct SequenceNumber(u32);

impl SequenceNumber {
    /// The value of a window that has not acknowledged anything yet.
    pub const ZERO: Self = Self(0);

    /// Creates a new sequence number.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw sequence number value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Returns the next sequence number.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u32> for SequenceNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for u32 {
    fn from(seq: SequenceNumber) -> Self {
        seq.0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Credentials presented when activating a session.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    /// No user identity.
    #[default]
    Anonymous,
    /// User name and password.
    UserName {
        /// User name.
        user: String,
        /// Password.
        password: String,
    },
    /// Opaque token issued by an external authority.
    IssuedToken(Bytes),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::UserName { user, .. } => f
                .debug_struct("UserName")
                .field("user", user)
                .field("password", &"***")
                .finish(),
            Self::IssuedToken(token) => write!(f, "IssuedToken({} bytes)", token.len()),
        }
    }
}

/// Identity returned by the server when a session is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Session identifier.
    pub session_id: SessionId,
    /// Authentication token for requests on the session.
    pub auth_token: AuthToken,
    /// Session timeout negotiated with the server.
    pub revised_timeout: Duration,
}

/// Parameters a subscription is created (and recreated) from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// Requested publishing interval.
    pub publishing_interval: Duration,
    /// Lifetime count, in publishing intervals.
    pub lifetime_count: u32,
    /// Maximum keep-alive count, in publishing intervals.
    pub max_keep_alive_count: u32,
    /// Maximum notifications per publish response (0 = unlimited).
    pub max_notifications_per_publish: u32,
    /// Relative priority among the session's subscriptions.
    pub priority: u8,
    /// Whether publishing is enabled on creation.
    pub publishing_enabled: bool,
    /// Encoded monitored item definitions; opaque to the session engine.
    pub monitored_items: Vec<Bytes>,
}

impl SubscriptionSettings {
    /// Creates settings with the given publishing interval and default counts.
    #[must_use]
    pub fn new(publishing_interval: Duration) -> Self {
        Self {
            publishing_interval,
            lifetime_count: 1200,
            max_keep_alive_count: 10,
            max_notifications_per_publish: 0,
            priority: 0,
            publishing_enabled: true,
            monitored_items: Vec::new(),
        }
    }

    /// Sets the lifetime and keep-alive counts.
    #[must_use]
    pub const fn with_counts(mut self, lifetime_count: u32, max_keep_alive_count: u32) -> Self {
        self.lifetime_count = lifetime_count;
        self.max_keep_alive_count = max_keep_alive_count;
        self
    }

    /// Sets the subscription priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Adds an encoded monitored item definition.
    #[must_use]
    pub fn with_monitored_item(mut self, item: Bytes) -> Self {
        self.monitored_items.push(item);
        self
    }
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

/// Server state as reported by an explicit keep-alive read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerState {
    /// The server is running normally.
    Running,
    /// The server has failed.
    Failed,
    /// The server has no configuration.
    NoConfiguration,
    /// The server is suspended.
    Suspended,
    /// The server is shutting down.
    Shutdown,
    /// The server is in test mode.
    Test,
    /// The server cannot reach its underlying data sources.
    CommunicationFault,
    /// The state is not known.
    Unknown,
}

impl ServerState {
    /// Returns true if the server state counts as a keep-alive.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}
