/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! # IronUA Client
//!
//! High-level session facade for the IronUA engine.
//!
//! This crate provides:
//! - **Session builder**: Fluent setup of configuration, credentials, subscriptions and observers
//! - **Session**: The running session with keep-alive, publish pipeline and recovery wired together
//! - **Templates**: Capture a session's setup and establish a fresh session from it

pub mod builder;
pub mod session;

pub use builder::{SessionBuilder, SessionTemplate};
pub use session::Session;
