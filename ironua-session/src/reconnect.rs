/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Reconnect controller.
//!
//! Recovery happens in suspect episodes. An episode opens when the keep-alive
//! deadline passes or a publish request fails with a session-fatal fault, and
//! closes when the session is `Connected` again, `Failed` or `Closed`.
//!
//! [`ReconnectController::reconnect`] runs one bounded attempt:
//! 1. Re-establish channel connectivity within the reconnect timeout
//! 2. Reactivate the original session
//! 3. On success, transfer subscriptions (or resume them in place)
//! 4. If the server no longer knows the session, create a new one and
//!    recreate every subscription with a fresh sequence window
//!
//! A subscription whose recreation is cut short stays registered and is
//! recreated first by the next attempt.
//!
//! A failed attempt leaves the session `Suspect`; retrying is the caller's call.

use crate::config::SessionConfig;
use crate::events::{EventDispatcher, SessionEvent, SubscriptionChange, SubscriptionEvent};
use crate::keepalive::KeepAliveMonitor;
use crate::publish::PipelineHandle;
use crate::registry::SubscriptionRegistry;
use crate::state::{ConnectionState, StateCell};
use ironua_core::error::{ServiceFault, SessionError};
use ironua_core::types::{Credentials, SessionIdentity, SubscriptionId};
use ironua_transport::SessionChannel;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a suspect episode was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerCause {
    /// No server activity before the keep-alive deadline.
    KeepAliveTimeout {
        /// Time since the last activity when the deadline was detected.
        silent_for: Duration,
    },
    /// A publish request failed with a session-fatal or unrecoverable fault.
    Fault(ServiceFault),
    /// The application asked for a reconnect.
    Manual,
}

impl fmt::Display for TriggerCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeepAliveTimeout { silent_for } => {
                write!(f, "keep-alive timeout after {} ms", silent_for.as_millis())
            }
            Self::Fault(fault) => write!(f, "publish fault: {fault}"),
            Self::Manual => f.write_str("manual reconnect"),
        }
    }
}

/// Request to open a suspect episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryTrigger {
    /// Connection episode the trigger was raised in.
    pub episode: u64,
    /// What was observed.
    pub cause: TriggerCause,
}

impl RecoveryTrigger {
    /// Creates a trigger.
    #[must_use]
    pub const fn new(episode: u64, cause: TriggerCause) -> Self {
        Self { episode, cause }
    }
}

/// Why an attempt ended with the session still suspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspectReason {
    /// A step did not finish in time.
    Timeout {
        /// The service call that timed out.
        operation: &'static str,
    },
    /// A step failed with a recoverable fault.
    Fault {
        /// The service call that failed.
        operation: &'static str,
        /// The fault.
        fault: ServiceFault,
    },
}

impl SuspectReason {
    /// Returns the fault, if the step failed rather than timed out.
    #[must_use]
    pub const fn fault(&self) -> Option<&ServiceFault> {
        match self {
            Self::Timeout { .. } => None,
            Self::Fault { fault, .. } => Some(fault),
        }
    }
}

impl fmt::Display for SuspectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { operation } => write!(f, "{operation} timed out"),
            Self::Fault { operation, fault } => write!(f, "{operation} failed: {fault}"),
        }
    }
}

/// What happened to the subscriptions during a recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Subscriptions confirmed by the server with their sequence state intact.
    pub transferred: Vec<SubscriptionId>,
    /// Subscriptions recreated on the server, as `(previous, current)` ids.
    pub recreated: Vec<(SubscriptionId, SubscriptionId)>,
    /// Subscriptions dropped because they could not be carried over.
    pub deleted: Vec<SubscriptionId>,
}

impl RecoverySummary {
    /// Lists the changes for a subscriptions-changed event.
    #[must_use]
    pub fn changes(&self) -> Vec<SubscriptionChange> {
        self.transferred
            .iter()
            .map(|id| SubscriptionChange::Transferred(*id))
            .chain(
                self.recreated
                    .iter()
                    .map(|(previous, current)| SubscriptionChange::Recreated {
                        previous: *previous,
                        current: *current,
                    }),
            )
            .chain(self.deleted.iter().map(|id| SubscriptionChange::Deleted(*id)))
            .collect()
    }
}

/// Result of a reconnect attempt that did not fail permanently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// The original session was reactivated and subscriptions kept in place.
    Resumed,
    /// The original session was reactivated and subscriptions transferred.
    Transferred(RecoverySummary),
    /// A new session was created and subscriptions recreated.
    Recreated(RecoverySummary),
    /// The attempt did not get through; the session is still suspect.
    StillSuspect(SuspectReason),
}

impl ReconnectOutcome {
    /// Returns true if the session is connected again.
    #[must_use]
    pub const fn is_recovered(&self) -> bool {
        !matches!(self, Self::StillSuspect(_))
    }
}

/// Timing and policy for reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectSettings {
    /// Name used when a new session has to be created.
    pub session_name: String,
    /// Requested timeout for a new session.
    pub session_timeout: Duration,
    /// Bound for re-establishing channel connectivity.
    pub reconnect_timeout: Duration,
    /// Bound for every other service call.
    pub operation_timeout: Duration,
    /// Transfer subscriptions after reactivating the original session.
    pub transfer_subscriptions: bool,
    /// Drop subscriptions the server does not confirm instead of recreating them.
    pub delete_unconfirmed: bool,
}

impl From<&SessionConfig> for ReconnectSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            session_name: config.session_name.clone(),
            session_timeout: config.session_timeout,
            reconnect_timeout: config.reconnect_timeout,
            operation_timeout: config.operation_timeout,
            transfer_subscriptions: config.transfer_subscriptions_on_reconnect,
            delete_unconfirmed: config.delete_subscriptions_on_close,
        }
    }
}

/// Shared components the controller coordinates.
#[derive(Clone)]
pub struct RecoveryContext {
    /// Service channel.
    pub channel: Arc<dyn SessionChannel>,
    /// Subscriptions and their sequence windows.
    pub registry: Arc<SubscriptionRegistry>,
    /// Event sink.
    pub dispatcher: Arc<EventDispatcher>,
    /// Connection state.
    pub state: Arc<StateCell>,
    /// Keep-alive monitor, restarted on recovery.
    pub monitor: Arc<Mutex<KeepAliveMonitor>>,
    /// Publish pipeline, paused for the duration of an episode.
    pub pipeline: Arc<PipelineHandle>,
    /// Identity of the current session, replaced when a new one is created.
    pub identity: Arc<RwLock<SessionIdentity>>,
    /// Credentials presented on activation.
    pub credentials: Credentials,
    /// Cancelled when the session closes.
    pub cancel: CancellationToken,
}

/// Drives suspect episodes to recovery or failure.
pub struct ReconnectController {
    ctx: RecoveryContext,
    settings: ReconnectSettings,
    attempt: tokio::sync::Mutex<()>,
    /// Subscriptions whose recreation was interrupted; the current session does not know them.
    stranded: Mutex<HashSet<SubscriptionId>>,
}

impl ReconnectController {
    /// Creates a controller.
    #[must_use]
    pub fn new(context: RecoveryContext, settings: ReconnectSettings) -> Self {
        Self {
            ctx: context,
            settings,
            attempt: tokio::sync::Mutex::new(()),
            stranded: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the attempt settings.
    #[must_use]
    pub const fn settings(&self) -> &ReconnectSettings {
        &self.settings
    }

    /// Opens a suspect episode.
    ///
    /// Only a `Connected` session in the trigger's episode moves to `Suspect`,
    /// so concurrent and stale triggers open at most one episode. The publish
    /// pipeline is paused.
    ///
    /// A trigger carrying an unrecoverable fault moves the session straight to
    /// `Failed` instead.
    ///
    /// Returns true if this call opened the episode.
    pub fn begin_suspect(&self, trigger: &RecoveryTrigger) -> bool {
        let current = self.ctx.state.episode();
        if trigger.episode != current {
            debug!(
                trigger_episode = trigger.episode,
                current_episode = current,
                cause = %trigger.cause,
                "stale recovery trigger ignored"
            );
            return false;
        }
        let unrecoverable = match &trigger.cause {
            TriggerCause::Fault(fault) if fault.is_unrecoverable() => Some(fault),
            _ => None,
        };
        if let Some(fault) = unrecoverable {
            if self
                .ctx
                .state
                .transition_from(ConnectionState::Connected, ConnectionState::Failed)
                .is_ok()
            {
                self.ctx.pipeline.pause();
                error!(fault = %fault, "session cannot be recovered");
            }
            return false;
        }
        if self
            .ctx
            .state
            .transition_from(ConnectionState::Connected, ConnectionState::Suspect)
            .is_err()
        {
            return false;
        }
        self.ctx.pipeline.pause();
        warn!(cause = %trigger.cause, "session suspect");
        true
    }

    /// Runs one reconnect attempt.
    ///
    /// A `Connected` session is first moved to `Suspect`. Closing the session
    /// aborts a running attempt.
    ///
    /// # Errors
    /// Returns `SessionError::Closed` if the session is or becomes closed,
    /// `SessionError::Failed` on an unrecoverable fault, and
    /// `SessionError::InvalidState` if the session already failed.
    pub async fn reconnect(&self) -> Result<ReconnectOutcome, SessionError> {
        let _attempt = self.attempt.lock().await;
        self.run_attempt().await
    }

    /// Runs one attempt only if the session is still suspect.
    ///
    /// Returns `Ok(None)` if another caller already ended the episode.
    ///
    /// # Errors
    /// Same as [`Self::reconnect`].
    pub async fn retry_suspect(&self) -> Result<Option<ReconnectOutcome>, SessionError> {
        let _attempt = self.attempt.lock().await;
        if self.ctx.state.get() != ConnectionState::Suspect {
            return Ok(None);
        }
        self.run_attempt().await.map(Some)
    }

    async fn run_attempt(&self) -> Result<ReconnectOutcome, SessionError> {
        match self.ctx.state.get() {
            ConnectionState::Connected => {
                let trigger = RecoveryTrigger::new(self.ctx.state.episode(), TriggerCause::Manual);
                self.begin_suspect(&trigger);
            }
            ConnectionState::Closed => return Err(SessionError::Closed),
            _ => {}
        }
        self.ctx
            .state
            .transition_from(ConnectionState::Suspect, ConnectionState::Reconnecting)?;

        info!(
            session = %self.ctx.identity.read().session_id,
            "reconnect attempt started"
        );
        let cancel = self.ctx.cancel.clone();
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("reconnect attempt aborted by close");
                Err(SessionError::Closed)
            }
            result = self.attempt() => result,
        }
    }

    async fn attempt(&self) -> Result<ReconnectOutcome, SessionError> {
        let channel = &self.ctx.channel;
        let connectivity = bounded(
            "connect",
            self.settings.reconnect_timeout,
            channel.connect(),
        )
        .await;
        if let Err(reason) = connectivity {
            return self.interrupted(reason);
        }

        let session_id = self.ctx.identity.read().session_id.clone();
        let activation = bounded(
            "activate",
            self.settings.operation_timeout,
            channel.activate(&session_id, &self.ctx.credentials),
        )
        .await;

        match activation {
            Ok(()) if self.settings.transfer_subscriptions => {
                debug!(session = %session_id, "session reactivated");
                self.ctx.state.transition(ConnectionState::Transferring)?;
                self.transfer().await
            }
            Ok(()) => {
                debug!(session = %session_id, "session reactivated in place");
                self.recovered(ReconnectOutcome::Resumed)
            }
            Err(SuspectReason::Fault { fault, .. }) if fault.is_session_unknown() => {
                info!(session = %session_id, fault = %fault, "server lost the session");
                self.ctx.state.transition(ConnectionState::Recreating)?;
                self.recreate().await
            }
            Err(reason) => self.interrupted(reason),
        }
    }

    async fn transfer(&self) -> Result<ReconnectOutcome, SessionError> {
        let mut summary = RecoverySummary::default();
        let (stranded, ids): (Vec<_>, Vec<_>) = {
            let pending = self.stranded.lock();
            self.ctx
                .registry
                .ids()
                .into_iter()
                .partition(|id| pending.contains(id))
        };
        for id in stranded {
            if let Some(reason) = self.recreate_subscription(id, &mut summary).await? {
                return self.interrupted_after(&summary, reason);
            }
        }
        if ids.is_empty() {
            return self.recovered(ReconnectOutcome::Transferred(summary));
        }

        let results = match bounded(
            "transfer_subscriptions",
            self.settings.operation_timeout,
            self.ctx.channel.transfer_subscriptions(&ids, false),
        )
        .await
        {
            Ok(results) => results,
            Err(SuspectReason::Fault { fault, .. }) if fault.is_session_unknown() => {
                info!(fault = %fault, "session lost during transfer");
                self.ctx.state.transition(ConnectionState::Recreating)?;
                return self.recreate().await;
            }
            Err(reason) => return self.interrupted(reason),
        };

        let mut confirmed = HashSet::new();
        for result in &results {
            match &result.result {
                Ok(()) => {
                    confirmed.insert(result.subscription_id);
                }
                Err(fault) => warn!(
                    subscription = %result.subscription_id,
                    fault = %fault,
                    "transfer rejected"
                ),
            }
        }

        for id in ids {
            if confirmed.contains(&id) {
                self.ctx
                    .dispatcher
                    .deliver(self.ctx.registry.observers(id), SubscriptionEvent::Transferred);
                summary.transferred.push(id);
            } else if self.settings.delete_unconfirmed {
                self.discard(id, &mut summary);
            } else if let Some(reason) = self.recreate_subscription(id, &mut summary).await? {
                return self.interrupted_after(&summary, reason);
            }
        }

        self.recovered(ReconnectOutcome::Transferred(summary))
    }

    async fn recreate(&self) -> Result<ReconnectOutcome, SessionError> {
        let channel = &self.ctx.channel;
        let identity = match bounded(
            "create_session",
            self.settings.operation_timeout,
            channel.create_session(&self.settings.session_name, self.settings.session_timeout),
        )
        .await
        {
            Ok(identity) => identity,
            Err(reason) => return self.interrupted(reason),
        };

        if let Err(reason) = bounded(
            "activate",
            self.settings.operation_timeout,
            channel.activate(&identity.session_id, &self.ctx.credentials),
        )
        .await
        {
            return self.interrupted(reason);
        }

        {
            let mut current = self.ctx.identity.write();
            info!(
                previous = %current.session_id,
                session = %identity.session_id,
                "session recreated"
            );
            *current = identity;
        }

        let mut summary = RecoverySummary::default();
        let ids = self.ctx.registry.ids();
        self.stranded.lock().extend(ids.iter().copied());
        for id in ids {
            if let Some(reason) = self.recreate_subscription(id, &mut summary).await? {
                return self.interrupted_after(&summary, reason);
            }
        }
        self.recovered(ReconnectOutcome::Recreated(summary))
    }

    /// Creates `id` again on the current session.
    ///
    /// Returns the reason if the server could not be reached; the subscription
    /// is kept and recreated by the next attempt.
    async fn recreate_subscription(
        &self,
        id: SubscriptionId,
        summary: &mut RecoverySummary,
    ) -> Result<Option<SuspectReason>, SessionError> {
        let Some(settings) = self.ctx.registry.settings(id) else {
            self.stranded.lock().remove(&id);
            return Ok(None);
        };

        match bounded(
            "create_subscription",
            self.settings.operation_timeout,
            self.ctx.channel.create_subscription(&settings),
        )
        .await
        {
            Ok(new_id) => match self.ctx.registry.replace_id(id, new_id) {
                Ok(observers) => {
                    self.stranded.lock().remove(&id);
                    debug!(previous = %id, current = %new_id, "subscription recreated");
                    self.ctx
                        .dispatcher
                        .deliver(observers, SubscriptionEvent::Recreated { previous: id });
                    summary.recreated.push((id, new_id));
                }
                Err(err) => {
                    warn!(subscription = %id, error = %err, "could not re-key subscription");
                    self.discard(id, summary);
                }
            },
            Err(SuspectReason::Fault { fault, .. }) if fault.is_unrecoverable() => {
                return self.fail(fault).map(|_| None);
            }
            Err(reason) => {
                warn!(subscription = %id, reason = %reason, "could not recreate subscription");
                self.stranded.lock().insert(id);
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    fn discard(&self, id: SubscriptionId, summary: &mut RecoverySummary) {
        self.stranded.lock().remove(&id);
        if let Ok(subscription) = self.ctx.registry.remove(id) {
            info!(subscription = %id, "subscription dropped during recovery");
            self.ctx
                .dispatcher
                .deliver(subscription.observers().to_vec(), SubscriptionEvent::Deleted);
            summary.deleted.push(id);
        }
    }

    fn recovered(&self, outcome: ReconnectOutcome) -> Result<ReconnectOutcome, SessionError> {
        match &outcome {
            ReconnectOutcome::Transferred(summary) | ReconnectOutcome::Recreated(summary) => {
                self.announce(summary);
            }
            ReconnectOutcome::Resumed | ReconnectOutcome::StillSuspect(_) => {}
        }

        self.ctx.state.transition(ConnectionState::Connected)?;
        self.ctx.monitor.lock().resume(Instant::now());
        self.ctx.pipeline.resume();
        info!(session = %self.ctx.identity.read().session_id, "session recovered");
        Ok(outcome)
    }

    fn announce(&self, summary: &RecoverySummary) {
        let changes = summary.changes();
        if !changes.is_empty() {
            self.ctx
                .dispatcher
                .emit(SessionEvent::SubscriptionsChanged(changes));
        }
    }

    /// Ends an attempt that already changed some subscriptions.
    fn interrupted_after(
        &self,
        summary: &RecoverySummary,
        reason: SuspectReason,
    ) -> Result<ReconnectOutcome, SessionError> {
        self.announce(summary);
        self.interrupted(reason)
    }

    fn interrupted(&self, reason: SuspectReason) -> Result<ReconnectOutcome, SessionError> {
        if let Some(fault) = reason.fault().filter(|fault| fault.is_unrecoverable()) {
            return self.fail(fault.clone());
        }
        warn!(reason = %reason, "reconnect attempt failed; session still suspect");
        self.ctx.state.transition(ConnectionState::Suspect)?;
        Ok(ReconnectOutcome::StillSuspect(reason))
    }

    fn fail(&self, fault: ServiceFault) -> Result<ReconnectOutcome, SessionError> {
        error!(fault = %fault, "session cannot be recovered");
        self.ctx.state.transition(ConnectionState::Failed)?;
        self.ctx.monitor.lock().resume(Instant::now());
        Err(SessionError::Failed(fault))
    }
}

impl fmt::Debug for ReconnectController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectController")
            .field("settings", &self.settings)
            .field("state", &self.ctx.state.get())
            .finish()
    }
}

async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    call: impl Future<Output = Result<T, ServiceFault>>,
) -> Result<T, SuspectReason> {
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(fault)) => Err(SuspectReason::Fault { operation, fault }),
        Err(_) => Err(SuspectReason::Timeout { operation }),
    }
}
