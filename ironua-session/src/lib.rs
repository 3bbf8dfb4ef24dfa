/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! # IronUA Session
//!
//! Client-side session continuity for the IronUA engine.
//!
//! This crate provides:
//! - **Sequence validation**: Per-subscription windows that classify, acknowledge and detect loss
//! - **Publish pipeline**: A self-replenishing pool of outstanding publish requests
//! - **Keep-alive**: Deadline tracking and a recurring timer capability
//! - **Subscription registry**: The session's authoritative subscription set
//! - **Reconnect**: Suspect episodes, reactivation, transfer and recreation
//! - **Events**: Ordered, panic-isolated delivery to observers
//! - **Configuration**: Session configuration with validation and live updates

pub mod config;
pub mod events;
pub mod keepalive;
pub mod publish;
pub mod reconnect;
pub mod registry;
pub mod sequence;
pub mod state;
pub mod timer;

pub use config::{ConfigUpdate, SessionConfig, SessionConfigBuilder};
pub use events::{
    DataLossEvent, EventDispatcher, EventKind, KeepAliveEvent, Observer, ObserverId, ObserverSet,
    PublishErrorEvent, SessionEvent, SubscriptionChange, SubscriptionEvent, SubscriptionObserver,
};
pub use keepalive::{KeepAliveCheck, KeepAliveMonitor};
pub use publish::{DrainReport, PipelineHandle, PublishPipeline, PublishSettings};
pub use reconnect::{
    ReconnectController, ReconnectOutcome, RecoverySummary, RecoveryTrigger, SuspectReason,
    TriggerCause,
};
pub use registry::{Subscription, SubscriptionInfo, SubscriptionRegistry, SubscriptionTemplate};
pub use sequence::{LostRange, SequenceClass, SequenceThresholds, SequenceWindow};
pub use state::{ConnectionState, StateCell};
pub use timer::{RecurringTimer, TokioTimer};
