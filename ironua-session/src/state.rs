/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Connection state machine.
//!
//! ```text
//! Connected -> Suspect -> Reconnecting -> Transferring -> Connected
//!                              |      \-> Recreating   -> Connected
//!                              \-> Suspect (attempt failed, caller retries)
//! any recovering state -> Failed        any state -> Closed
//! ```
//!
//! The state is shared between the keep-alive timer, the publish pipeline, the
//! reconnect controller and application threads, so every transition is a
//! checked compare-and-set on a [`StateCell`]. Each accepted transition is
//! narrated through the [`EventDispatcher`].

use crate::events::{EventDispatcher, SessionEvent};
use ironua_core::error::SessionError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, info};

/// Lifecycle state of a session's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// The session is healthy and publishing.
    Connected,
    /// The server went silent or a session-fatal fault was seen.
    Suspect,
    /// A reconnect attempt is re-establishing connectivity.
    Reconnecting,
    /// The original session was reactivated; subscriptions are being transferred.
    Transferring,
    /// A new session is being created and subscriptions recreated.
    Recreating,
    /// The session cannot be recovered and must be closed by the application.
    Failed,
    /// The session was closed locally.
    Closed,
}

impl ConnectionState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::Suspect => "Suspect",
            Self::Reconnecting => "Reconnecting",
            Self::Transferring => "Transferring",
            Self::Recreating => "Recreating",
            Self::Failed => "Failed",
            Self::Closed => "Closed",
        }
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{
            Closed, Connected, Failed, Reconnecting, Recreating, Suspect, Transferring,
        };
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Failed, _) => false,
            (Connected, Suspect | Failed) => true,
            (Suspect, Reconnecting | Failed) => true,
            (Reconnecting, Transferring | Recreating | Connected | Suspect | Failed) => true,
            (Transferring, Connected | Recreating | Suspect | Failed) => true,
            (Recreating, Connected | Suspect | Failed) => true,
            _ => false,
        }
    }

    /// Returns true while a suspect episode is being handled.
    #[must_use]
    pub const fn is_recovering(self) -> bool {
        matches!(
            self,
            Self::Suspect | Self::Reconnecting | Self::Transferring | Self::Recreating
        )
    }

    /// Returns true if no further transition (other than close) is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable connection state.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
    /// Incremented every time the session (re)enters `Connected`.
    episode: AtomicU64,
    dispatcher: Arc<EventDispatcher>,
}

impl StateCell {
    /// Creates a cell in the `Connected` state.
    #[must_use]
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Connected);
        Self {
            tx,
            episode: AtomicU64::new(0),
            dispatcher,
        }
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Returns the current connection episode.
    ///
    /// Recovery triggers carry the episode they were raised in so that a
    /// trigger from before a recovery cannot open a new suspect episode.
    #[must_use]
    pub fn episode(&self) -> u64 {
        self.episode.load(Ordering::SeqCst)
    }

    /// Returns a receiver that observes every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Moves to `next` if the state machine allows it.
    ///
    /// # Returns
    /// The previous state.
    ///
    /// # Errors
    /// Returns `SessionError::InvalidState` if the transition is not allowed,
    /// or `SessionError::Closed` if the session is closed.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, SessionError> {
        self.transition_if(next, |_| true)
    }

    /// Moves from exactly `from` to `next`.
    ///
    /// # Errors
    /// Returns `SessionError::InvalidState` if the current state is not `from`.
    pub fn transition_from(
        &self,
        from: ConnectionState,
        next: ConnectionState,
    ) -> Result<ConnectionState, SessionError> {
        self.transition_if(next, |current| current == from)
            .map_err(|err| match err {
                SessionError::InvalidState { current, .. } => SessionError::InvalidState {
                    expected: from.to_string(),
                    current,
                },
                other => other,
            })
    }

    /// Moves to `Closed` from any state.
    ///
    /// # Returns
    /// The previous state, or `None` if the session was already closed.
    pub fn close(&self) -> Option<ConnectionState> {
        self.transition(ConnectionState::Closed).ok()
    }

    fn transition_if(
        &self,
        next: ConnectionState,
        guard: impl FnOnce(ConnectionState) -> bool,
    ) -> Result<ConnectionState, SessionError> {
        let mut previous = None;
        let mut observed = ConnectionState::Closed;
        self.tx.send_if_modified(|state| {
            observed = *state;
            if guard(*state) && state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });

        let Some(from) = previous else {
            debug!(current = %observed, requested = %next, "state transition rejected");
            return Err(if observed == ConnectionState::Closed {
                SessionError::Closed
            } else {
                SessionError::InvalidState {
                    expected: format!("a state that can move to {next}"),
                    current: observed.to_string(),
                }
            });
        };

        if next == ConnectionState::Connected {
            self.episode.fetch_add(1, Ordering::SeqCst);
        }
        info!(from = %from, to = %next, "session state changed");
        self.dispatcher.emit(SessionEvent::StateChanged { from, to: next });
        Ok(from)
    }
}
