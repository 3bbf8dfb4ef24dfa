/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! # IronUA Core
//!
//! Core types, identifiers, and error definitions for the IronUA session engine.
//!
//! This crate provides the fundamental building blocks used across all IronUA crates:
//! - **Error types**: Unified error handling with `thiserror`, including fault severity
//! - **Identifiers**: `SessionId`, `SubscriptionId`, `SequenceNumber`
//! - **Notifications**: `NotificationMessage`, `PublishResponse`, acknowledgements

pub mod error;
pub mod notification;
pub mod types;

pub use error::{ConfigError, FaultSeverity, Result, ServiceFault, SessionError, UaError};
pub use notification::{
    NotificationMessage, PublishResponse, SubscriptionAcknowledgement, TransferResult,
};
pub use types::{
    AuthToken, Credentials, SequenceNumber, ServerState, SessionId, SessionIdentity,
    SubscriptionId, SubscriptionSettings,
};
