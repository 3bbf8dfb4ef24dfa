/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! # IronUA Transport
//!
//! The RPC layer consumed by the IronUA session engine.
//!
//! Wire encoding, secure channels and sockets live behind this boundary. This
//! crate provides:
//! - **SessionChannel trait**: Asynchronous service-call interface
//! - **BlockingAdapter**: Runs a synchronous [`BlockingSessionChannel`] on the blocking pool
//! - **LoopbackChannel**: Scripted in-memory server for testing and demos

pub mod blocking;
pub mod loopback;
pub mod traits;

pub use blocking::{BlockingAdapter, BlockingSessionChannel};
pub use loopback::LoopbackChannel;
pub use traits::SessionChannel;
