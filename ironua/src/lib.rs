/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! # IronUA
//!
//! Client-side session continuity for stateful, subscription-based industrial
//! control protocols.
//!
//! IronUA keeps a logical session alive across an unreliable transport. It
//! pipelines publish requests so the server always has one to answer,
//! validates notification ordering per subscription, detects silent failure
//! with a keep-alive deadline and recovers the session (or recreates it) after
//! a disconnect.
//!
//! ## Features
//!
//! - **Publish pipeline**: A self-replenishing pool of outstanding requests with piggybacked acknowledgements
//! - **Sequence validation**: Duplicate suppression, out-of-order tolerance, republish and data-loss reporting
//! - **Keep-alive**: Deadline tracking with an explicit server-state check
//! - **Recovery**: Reactivation, subscription transfer and recreation under a new session
//! - **Flexible RPC layer**: Works with asynchronous or blocking service channels
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ironua::prelude::*;
//!
//! let session = SessionBuilder::new(SessionConfig::new("plant", "opc.tcp://plc:4840"))
//!     .with_subscription(SubscriptionSettings::default())
//!     .with_observer(EventKind::Publish, |event| println!("{event:?}"))
//!     .connect(channel)
//!     .await?;
//! ```
//!
//! ## Crate Organization
//!
//! - [`core`]: Identifiers, notifications and error definitions
//! - [`transport`]: The service channel interface and its adapters
//! - [`session`]: Session-continuity components
//! - [`client`]: High-level session facade

pub mod core {
    //! Identifiers, notifications and error definitions.
    pub use ironua_core::*;
}

pub mod transport {
    //! Service channel interface and adapters.
    pub use ironua_transport::*;
}

pub mod session {
    //! Session-continuity components.
    pub use ironua_session::*;
}

pub mod client {
    //! High-level session facade.
    pub use ironua_client::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    // Core types
    pub use ironua_core::{
        ConfigError, Credentials, FaultSeverity, NotificationMessage, Result, SequenceNumber,
        ServerState, ServiceFault, SessionError, SessionId, SubscriptionAcknowledgement,
        SubscriptionId, SubscriptionSettings, UaError,
    };

    // Transport
    pub use ironua_transport::{
        BlockingAdapter, BlockingSessionChannel, LoopbackChannel, SessionChannel,
    };

    // Session
    pub use ironua_session::{
        ConfigUpdate, ConnectionState, DataLossEvent, DrainReport, EventKind, LostRange,
        ObserverId, ReconnectOutcome, SequenceThresholds, SessionConfig, SessionConfigBuilder,
        SessionEvent, SubscriptionChange, SubscriptionEvent, SubscriptionInfo,
        SubscriptionTemplate,
    };

    // Client
    pub use ironua_client::{Session, SessionBuilder, SessionTemplate};
}
