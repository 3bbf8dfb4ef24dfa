/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Running session.
//!
//! A [`Session`] owns the keep-alive timer, the publish pipeline and the
//! reconnect controller, and a supervisor task that turns recovery triggers
//! into suspect episodes. Cloning a session yields another handle to the
//! same session.

use crate::builder::SessionTemplate;
use chrono::Utc;
use ironua_core::error::{Result, ServiceFault, SessionError, UaError};
use ironua_core::types::{
    Credentials, SessionId, SessionIdentity, SubscriptionId, SubscriptionSettings,
};
use ironua_session::config::{ConfigUpdate, SessionConfig};
use ironua_session::events::{
    EventDispatcher, EventKind, KeepAliveEvent, ObserverId, ObserverSet, SessionEvent,
    SubscriptionChange, SubscriptionEvent,
};
use ironua_session::keepalive::{KeepAliveCheck, KeepAliveMonitor};
use ironua_session::publish::{
    DrainReport, PipelineContext, PipelineHandle, PublishPipeline, PublishSettings,
};
use ironua_session::reconnect::{
    ReconnectController, ReconnectOutcome, ReconnectSettings, RecoveryContext, RecoveryTrigger,
    TriggerCause,
};
use ironua_session::registry::{
    Subscription, SubscriptionInfo, SubscriptionRegistry, SubscriptionTemplate,
};
use ironua_session::state::{ConnectionState, StateCell};
use ironua_session::timer::{RecurringTimer, TokioTimer};
use ironua_transport::SessionChannel;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Upper bound for delivering queued events when a session closes.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Output of the establishment handshake.
pub(crate) struct Established {
    pub(crate) config: SessionConfig,
    pub(crate) channel: Arc<dyn SessionChannel>,
    pub(crate) identity: SessionIdentity,
    pub(crate) credentials: Credentials,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) observers: ObserverSet,
}

/// Runs a service call under a deadline.
pub(crate) async fn bounded_call<T>(
    operation: &'static str,
    limit: Duration,
    call: impl Future<Output = std::result::Result<T, ServiceFault>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(UaError::from),
        Err(_) => Err(SessionError::Timeout {
            operation,
            elapsed_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
        .into()),
    }
}

/// A running session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: Arc<RwLock<SessionConfig>>,
    channel: Arc<dyn SessionChannel>,
    identity: Arc<RwLock<SessionIdentity>>,
    credentials: Credentials,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<EventDispatcher>,
    state: Arc<StateCell>,
    monitor: Arc<Mutex<KeepAliveMonitor>>,
    pipeline: Arc<PipelineHandle>,
    controller: Arc<ReconnectController>,
    timer: TokioTimer,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.timer.stop();
    }
}

impl Session {
    /// Wires the components of an established session together and starts
    /// the keep-alive timer, the publish pipeline and the supervisor.
    pub(crate) fn start(established: Established) -> Self {
        let Established {
            config,
            channel,
            identity,
            credentials,
            registry,
            observers,
        } = established;

        let dispatcher = Arc::new(EventDispatcher::with_observers(observers));
        let registry = Arc::new(registry);
        let state = Arc::new(StateCell::new(Arc::clone(&dispatcher)));
        let monitor = Arc::new(Mutex::new(KeepAliveMonitor::new(
            config.keep_alive_interval,
            Instant::now(),
        )));
        let (triggers, trigger_rx) = mpsc::unbounded_channel();

        let pipeline = Arc::new(PublishPipeline::spawn(
            PipelineContext {
                channel: Arc::clone(&channel),
                registry: Arc::clone(&registry),
                dispatcher: Arc::clone(&dispatcher),
                monitor: Arc::clone(&monitor),
                state: Arc::clone(&state),
                triggers: triggers.clone(),
            },
            PublishSettings::from(&config),
        ));

        let identity = Arc::new(RwLock::new(identity));
        let cancel = CancellationToken::new();
        let controller = Arc::new(ReconnectController::new(
            RecoveryContext {
                channel: Arc::clone(&channel),
                registry: Arc::clone(&registry),
                dispatcher: Arc::clone(&dispatcher),
                state: Arc::clone(&state),
                monitor: Arc::clone(&monitor),
                pipeline: Arc::clone(&pipeline),
                identity: Arc::clone(&identity),
                credentials: credentials.clone(),
                cancel: cancel.clone(),
            },
            ReconnectSettings::from(&config),
        ));

        let keep_alive_interval = config.keep_alive_interval;
        let config = Arc::new(RwLock::new(config));

        let tick = KeepAliveTick {
            channel: Arc::clone(&channel),
            state: Arc::clone(&state),
            monitor: Arc::clone(&monitor),
            dispatcher: Arc::clone(&dispatcher),
            triggers,
            config: Arc::clone(&config),
            checking: Arc::new(AtomicBool::new(false)),
        };
        let timer = TokioTimer::new(Handle::current());
        timer.start(keep_alive_interval, Arc::new(move || tick.on_tick()));

        let supervisor = tokio::spawn(supervise(
            Arc::clone(&controller),
            Arc::clone(&config),
            trigger_rx,
            cancel.clone(),
        ));

        Self {
            inner: Arc::new(SessionInner {
                config,
                channel,
                identity,
                credentials,
                registry,
                dispatcher,
                state,
                monitor,
                pipeline,
                controller,
                timer,
                cancel,
                supervisor: Mutex::new(Some(supervisor)),
            }),
        }
    }

    /// Returns the server-assigned session id.
    ///
    /// Changes when recovery has to create a new session.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.inner.identity.read().session_id.clone()
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Returns a receiver that observes every connection-state change.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Returns a copy of the current configuration.
    #[must_use]
    pub fn config(&self) -> SessionConfig {
        self.inner.config.read().clone()
    }

    /// Lists the session's subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.registry.list()
    }

    /// Returns one subscription.
    #[must_use]
    pub fn subscription(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.inner.registry.get(id)
    }

    /// Creates a subscription on the server and attaches it to the session.
    ///
    /// # Errors
    /// Returns `SessionError::InvalidState` unless the session is `Connected`,
    /// or the fault/timeout of the service call.
    pub async fn create_subscription(
        &self,
        settings: SubscriptionSettings,
    ) -> Result<SubscriptionId> {
        self.create_subscription_from(SubscriptionTemplate::new(settings))
            .await
    }

    /// Creates a subscription together with its observers.
    ///
    /// # Errors
    /// Same as [`Self::create_subscription`].
    pub async fn create_subscription_from(
        &self,
        template: SubscriptionTemplate,
    ) -> Result<SubscriptionId> {
        self.require_connected()?;
        let timeout = self.inner.config.read().operation_timeout;

        let id = bounded_call(
            "create_subscription",
            timeout,
            self.inner.channel.create_subscription(&template.settings),
        )
        .await?;
        self.inner
            .registry
            .add(Subscription::from_template(id, template))?;

        info!(subscription = %id, "subscription created");
        self.inner
            .dispatcher
            .emit(SessionEvent::SubscriptionsChanged(vec![
                SubscriptionChange::Added(id),
            ]));
        Ok(id)
    }

    /// Deletes a subscription.
    ///
    /// While `Connected` the subscription is deleted on the server first;
    /// otherwise it is only detached locally and is not carried over by the
    /// next recovery.
    ///
    /// # Errors
    /// Returns `SessionError::SubscriptionNotFound` for an unknown id, or the
    /// fault/timeout of the server-side delete.
    pub async fn delete_subscription(&self, id: SubscriptionId) -> Result<()> {
        let state = self.inner.state.get();
        if state == ConnectionState::Closed {
            return Err(SessionError::Closed.into());
        }
        if !self.inner.registry.contains(id) {
            return Err(SessionError::SubscriptionNotFound(id).into());
        }

        if state == ConnectionState::Connected {
            let timeout = self.inner.config.read().operation_timeout;
            match bounded_call(
                "delete_subscriptions",
                timeout,
                self.inner.channel.delete_subscriptions(&[id]),
            )
            .await
            {
                Ok(()) => {}
                Err(UaError::Fault(ServiceFault::SubscriptionIdInvalid(_))) => {
                    debug!(subscription = %id, "server no longer knew the subscription");
                }
                Err(err) => return Err(err),
            }
        }

        let removed = self.inner.registry.remove(id)?;
        info!(subscription = %id, "subscription deleted");
        self.inner
            .dispatcher
            .deliver(removed.observers().to_vec(), SubscriptionEvent::Deleted);
        self.inner
            .dispatcher
            .emit(SessionEvent::SubscriptionsChanged(vec![
                SubscriptionChange::Removed(id),
            ]));
        Ok(())
    }

    /// Registers a session-level observer.
    pub fn subscribe<F>(&self, kind: EventKind, observer: F) -> ObserverId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe(kind, observer)
    }

    /// Registers an observer for one subscription.
    ///
    /// # Errors
    /// Returns `SessionError::SubscriptionNotFound` for an unknown id.
    pub fn subscribe_subscription<F>(&self, id: SubscriptionId, observer: F) -> Result<ObserverId>
    where
        F: Fn(&SubscriptionEvent) + Send + Sync + 'static,
    {
        Ok(self.inner.registry.subscribe(id, Arc::new(observer))?)
    }

    /// Removes a session-level or subscription observer.
    ///
    /// Returns true if the observer was registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.inner.dispatcher.unsubscribe(id) || self.inner.registry.unsubscribe(id)
    }

    /// Returns the number of session-level observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.dispatcher.total_observer_count()
    }

    /// Runs one reconnect attempt.
    ///
    /// A `Connected` session first enters a manual suspect episode.
    ///
    /// # Errors
    /// Returns `SessionError::Closed` if the session is or becomes closed and
    /// `SessionError::Failed` if the server rejects the client's identity.
    pub async fn reconnect(&self) -> Result<ReconnectOutcome> {
        Ok(self.inner.controller.reconnect().await?)
    }

    /// Closes the session.
    ///
    /// Stops the keep-alive timer and any recovery, drains the publish
    /// pipeline for up to the operation timeout, then closes the session on
    /// the server if it was reachable.
    ///
    /// # Errors
    /// Returns `SessionError::Closed` if the session was already closed.
    pub async fn close(&self) -> Result<DrainReport> {
        let inner = &self.inner;
        let Some(previous) = inner.state.close() else {
            return Err(SessionError::Closed.into());
        };

        let (delete, timeout) = {
            let config = inner.config.read();
            (config.delete_subscriptions_on_close, config.operation_timeout)
        };
        inner.dispatcher.emit(SessionEvent::Closing {
            delete_subscriptions: delete,
        });

        inner.cancel.cancel();
        inner.timer.stop();
        let report = inner.pipeline.close(timeout).await;

        if previous == ConnectionState::Connected {
            if let Err(err) = bounded_call("close", timeout, inner.channel.close(delete)).await {
                warn!(error = %err, "server-side close failed");
            }
        }

        if delete {
            for subscription in inner.registry.clear() {
                inner
                    .dispatcher
                    .deliver(subscription.observers().to_vec(), SubscriptionEvent::Deleted);
            }
        }

        let supervisor = inner.supervisor.lock().take();
        if let Some(task) = supervisor {
            let _ = task.await;
        }

        if !self.flush_events(CLOSE_FLUSH_TIMEOUT).await {
            warn!("observers did not drain before close returned");
        }

        info!(
            session_id = %self.session_id(),
            completed = report.completed,
            cancelled = report.cancelled,
            "session closed"
        );
        Ok(report)
    }

    /// Returns the number of publish requests currently outstanding.
    #[must_use]
    pub fn outstanding_publish_requests(&self) -> usize {
        self.inner.pipeline.outstanding()
    }

    /// Captures configuration, credentials and subscriptions so an identical
    /// session can be established with [`crate::SessionBuilder::from_template`].
    #[must_use]
    pub fn to_template(&self, copy_observers: bool) -> SessionTemplate {
        SessionTemplate {
            config: self.config(),
            credentials: self.inner.credentials.clone(),
            subscriptions: self.inner.registry.clone_subscriptions(copy_observers),
            observers: if copy_observers {
                self.inner.dispatcher.observers()
            } else {
                ObserverSet::new()
            },
        }
    }

    /// Applies a runtime configuration change.
    ///
    /// # Errors
    /// Returns `UaError::Config` if the result would be invalid and
    /// `SessionError::Closed` after close.
    pub fn update_config(&self, update: &ConfigUpdate) -> Result<()> {
        if self.inner.state.get() == ConnectionState::Closed {
            return Err(SessionError::Closed.into());
        }

        let next = {
            let mut config = self.inner.config.write();
            let next = config.apply_update(update)?;
            *config = next.clone();
            next
        };

        if update.keep_alive_interval.is_some() {
            self.inner
                .monitor
                .lock()
                .set_interval(next.keep_alive_interval);
            self.inner.timer.reset(next.keep_alive_interval);
        }
        if update.min_publish_requests.is_some() || update.max_publish_requests.is_some() {
            self.inner.pipeline.reconfigure(PublishSettings::from(&next));
        }

        info!(
            keep_alive_ms = next.keep_alive_interval.as_millis(),
            min_publish = next.min_publish_requests,
            max_publish = next.max_publish_requests,
            "configuration updated"
        );
        self.inner
            .dispatcher
            .emit(SessionEvent::ConfigurationChanged(Box::new(next)));
        Ok(())
    }

    /// Waits until every event emitted so far has been delivered.
    ///
    /// Returns false on timeout.
    pub async fn flush_events(&self, timeout: Duration) -> bool {
        let dispatcher = Arc::clone(&self.inner.dispatcher);
        tokio::task::spawn_blocking(move || dispatcher.flush(timeout))
            .await
            .unwrap_or(false)
    }

    fn require_connected(&self) -> Result<()> {
        match self.inner.state.get() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(SessionError::Closed.into()),
            current => Err(SessionError::InvalidState {
                expected: ConnectionState::Connected.to_string(),
                current: current.to_string(),
            }
            .into()),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .field("subscriptions", &self.inner.registry.len())
            .field("outstanding", &self.outstanding_publish_requests())
            .finish()
    }
}

/// Turns recovery triggers into suspect episodes and, when a reconnect
/// period is configured, retries until the episode ends.
async fn supervise(
    controller: Arc<ReconnectController>,
    config: Arc<RwLock<SessionConfig>>,
    mut triggers: mpsc::UnboundedReceiver<RecoveryTrigger>,
    cancel: CancellationToken,
) {
    loop {
        let trigger = tokio::select! {
            () = cancel.cancelled() => break,
            received = triggers.recv() => match received {
                Some(trigger) => trigger,
                None => break,
            },
        };
        if !controller.begin_suspect(&trigger) {
            continue;
        }

        loop {
            let period = config.read().reconnect_period;
            let Some(period) = period else {
                break;
            };
            match controller.retry_suspect().await {
                Ok(Some(ReconnectOutcome::StillSuspect(reason))) => {
                    debug!(
                        reason = %reason,
                        retry_in_ms = period.as_millis(),
                        "automatic reconnect will retry"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(period) => {}
                    }
                }
                Ok(_) => break,
                Err(err) => {
                    debug!(error = %err, "automatic reconnect stopped");
                    break;
                }
            }
        }
    }
    trace!("session supervisor stopped");
}

/// State captured by the keep-alive timer callback.
struct KeepAliveTick {
    channel: Arc<dyn SessionChannel>,
    state: Arc<StateCell>,
    monitor: Arc<Mutex<KeepAliveMonitor>>,
    dispatcher: Arc<EventDispatcher>,
    triggers: mpsc::UnboundedSender<RecoveryTrigger>,
    config: Arc<RwLock<SessionConfig>>,
    checking: Arc<AtomicBool>,
}

impl KeepAliveTick {
    fn on_tick(&self) {
        let now = Instant::now();
        let state = self.state.get();

        // Deadlines are only evaluated while connected; recovery owns the
        // monitor otherwise and resumes it when the episode ends.
        let (silent_for, verdict, idle) = {
            let mut monitor = self.monitor.lock();
            let silent_for = now.saturating_duration_since(monitor.last_activity());
            let verdict = (state == ConnectionState::Connected).then(|| monitor.check(now));
            (silent_for, verdict, monitor.is_idle(now))
        };

        let suspect = match verdict {
            Some(KeepAliveCheck::Healthy { .. }) => false,
            Some(_) => true,
            None => state.is_recovering(),
        };
        self.dispatcher.emit(SessionEvent::KeepAlive(KeepAliveEvent {
            state,
            silent_for,
            suspect,
            timestamp: Utc::now(),
        }));

        match verdict {
            Some(KeepAliveCheck::Suspect { silent_for }) => {
                warn!(
                    silent_ms = silent_for.as_millis(),
                    "keep-alive deadline passed"
                );
                let trigger = RecoveryTrigger::new(
                    self.state.episode(),
                    TriggerCause::KeepAliveTimeout { silent_for },
                );
                if self.triggers.send(trigger).is_err() {
                    debug!("session supervisor gone; keep-alive trigger dropped");
                }
            }
            Some(KeepAliveCheck::Healthy { .. }) if idle => self.check_server_state(),
            _ => {}
        }
    }

    /// Sends an explicit keep-alive read; a running server counts as activity.
    fn check_server_state(&self) {
        if self.checking.swap(true, Ordering::SeqCst) {
            return;
        }

        let channel = Arc::clone(&self.channel);
        let monitor = Arc::clone(&self.monitor);
        let checking = Arc::clone(&self.checking);
        let triggers = self.triggers.clone();
        let episode = self.state.episode();
        let timeout = self.config.read().operation_timeout;

        tokio::spawn(async move {
            match bounded_call("read_server_state", timeout, channel.read_server_state()).await {
                Ok(server_state) if server_state.is_running() => {
                    trace!("explicit keep-alive answered");
                    monitor.lock().record_activity(Instant::now());
                }
                Ok(server_state) => {
                    warn!(server_state = ?server_state, "server is not running");
                }
                Err(UaError::Fault(fault))
                    if fault.is_session_fatal() || fault.is_unrecoverable() =>
                {
                    let trigger = RecoveryTrigger::new(episode, TriggerCause::Fault(fault));
                    let _ = triggers.send(trigger);
                }
                Err(err) => debug!(error = %err, "explicit keep-alive failed"),
            }
            checking.store(false, Ordering::SeqCst);
        });
    }
}
