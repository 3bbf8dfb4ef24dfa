/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Publish pipeline.
//!
//! The pipeline keeps a pool of publish requests parked on the server so that
//! notifications can be returned as soon as they are ready:
//! - Every completion (data, keep-alive or fault) issues exactly one replacement
//! - Acknowledgements ride on the next request issued
//! - The pool grows with the number of subscriptions, bounded by a ceiling
//!
//! A single driver task owns the in-flight requests. Other components talk to it
//! through a [`PipelineHandle`]; its counters are readable without a round trip.

use crate::config::{MAX_PUBLISH_REQUESTS_CAP, SessionConfig};
use crate::events::{
    DataLossEvent, EventDispatcher, PublishErrorEvent, SessionEvent, SubscriptionEvent,
};
use crate::keepalive::KeepAliveMonitor;
use crate::reconnect::{RecoveryTrigger, TriggerCause};
use crate::registry::{Observation, SubscriptionObservers, SubscriptionRegistry};
use crate::sequence::{LostRange, SequenceClass};
use crate::state::StateCell;
use ironua_core::error::{FaultSeverity, ServiceFault};
use ironua_core::notification::{
    NotificationMessage, PublishResponse, SubscriptionAcknowledgement,
};
use ironua_core::types::{SequenceNumber, SubscriptionId};
use ironua_transport::SessionChannel;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, Id, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

type AckBatch = SmallVec<[SubscriptionAcknowledgement; 8]>;

/// Number of publish requests the pipeline aims to keep outstanding.
///
/// One per active subscription, at least `min_requests`, never more than the
/// ceiling (`max_requests` capped at 100) and never less than one.
#[must_use]
pub fn desired_outstanding(min_requests: usize, max_requests: usize, active: usize) -> usize {
    let ceiling = max_requests.clamp(1, MAX_PUBLISH_REQUESTS_CAP);
    active.max(min_requests).clamp(1, ceiling)
}

/// Sizing and retry parameters of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishSettings {
    /// Lower bound of outstanding requests.
    pub min_requests: usize,
    /// Upper bound of outstanding requests before the hard cap.
    pub max_requests: usize,
    /// Delay before replacing a request that failed with a transient fault.
    pub retry_delay: Duration,
    /// Bound for republish calls.
    pub operation_timeout: Duration,
}

impl From<&SessionConfig> for PublishSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            min_requests: config.min_publish_requests,
            max_requests: config.max_publish_requests,
            retry_delay: config.publish_retry_delay,
            operation_timeout: config.operation_timeout,
        }
    }
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            min_requests: 1,
            max_requests: MAX_PUBLISH_REQUESTS_CAP,
            retry_delay: Duration::from_millis(100),
            operation_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of closing the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Requests that completed during the drain and were processed normally.
    pub completed: usize,
    /// Requests still outstanding when the drain timed out.
    pub cancelled: usize,
}

/// Shared components the pipeline works with.
#[derive(Clone)]
pub struct PipelineContext {
    /// Service channel used for publish and republish calls.
    pub channel: Arc<dyn SessionChannel>,
    /// Subscriptions and their sequence windows.
    pub registry: Arc<SubscriptionRegistry>,
    /// Event sink.
    pub dispatcher: Arc<EventDispatcher>,
    /// Activity clock fed by every completion.
    pub monitor: Arc<Mutex<KeepAliveMonitor>>,
    /// Connection state, used to tag recovery triggers.
    pub state: Arc<StateCell>,
    /// Where session-fatal faults are reported.
    pub triggers: mpsc::UnboundedSender<RecoveryTrigger>,
}

enum Command {
    Pause,
    Resume,
    Wake,
    Reconfigure(PublishSettings),
    Close {
        drain_timeout: Duration,
        reply: oneshot::Sender<DrainReport>,
    },
}

#[derive(Debug, Default)]
struct Counters {
    outstanding: AtomicUsize,
    target: AtomicUsize,
    paused: AtomicBool,
}

/// Control handle of a running pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    commands: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
}

impl PipelineHandle {
    /// Stops issuing new requests. In-flight requests still complete.
    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    /// Resumes issuing requests and lifts any server-imposed throttle.
    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Re-evaluates the pool size, e.g. after the subscription set changed.
    pub fn wake(&self) {
        self.send(Command::Wake);
    }

    /// Applies new sizing parameters at the next replenishment.
    pub fn reconfigure(&self, settings: PublishSettings) {
        self.send(Command::Reconfigure(settings));
    }

    /// Returns the number of requests currently outstanding.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.counters.outstanding.load(Ordering::Acquire)
    }

    /// Returns the pool size the pipeline currently aims for.
    #[must_use]
    pub fn target(&self) -> usize {
        self.counters.target.load(Ordering::Acquire)
    }

    /// Returns true while the pipeline is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.counters.paused.load(Ordering::Acquire)
    }

    /// Stops the pipeline.
    ///
    /// Outstanding requests get up to `drain_timeout` to complete; completions
    /// in that window are processed normally. The rest are cancelled and their
    /// acknowledgements kept for a later session.
    pub async fn close(&self, drain_timeout: Duration) -> DrainReport {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Close {
                drain_timeout,
                reply,
            })
            .is_err()
        {
            return DrainReport::default();
        }
        rx.await.unwrap_or_default()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("publish pipeline already stopped");
        }
    }
}

/// Entry point for starting the pipeline.
pub struct PublishPipeline;

impl PublishPipeline {
    /// Spawns the driver task on the current runtime and returns its handle.
    ///
    /// The pipeline starts active and fills its pool immediately.
    #[must_use]
    pub fn spawn(context: PipelineContext, settings: PublishSettings) -> PipelineHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let driver = Driver {
            ctx: context,
            settings,
            counters: Arc::clone(&counters),
            slots: JoinSet::new(),
            in_flight: HashMap::new(),
            tasks: HashMap::new(),
            republishes: JoinSet::new(),
            next_handle: 0,
            paused: false,
            idle: false,
            throttle: None,
            retry_after: None,
        };
        tokio::spawn(driver.run(rx));
        PipelineHandle { commands, counters }
    }
}

struct Slot {
    issued_at: Instant,
    episode: u64,
    acks: AckBatch,
    task: AbortHandle,
}

struct SlotOutcome {
    handle: u64,
    result: Result<PublishResponse, ServiceFault>,
}

struct RepublishOutcome {
    subscription_id: SubscriptionId,
    sequence_number: SequenceNumber,
    result: Result<NotificationMessage, ServiceFault>,
}

struct Driver {
    ctx: PipelineContext,
    settings: PublishSettings,
    counters: Arc<Counters>,
    slots: JoinSet<SlotOutcome>,
    in_flight: HashMap<u64, Slot>,
    /// Slot handle of every spawned request task, for tasks that never return an outcome.
    tasks: HashMap<Id, u64>,
    republishes: JoinSet<RepublishOutcome>,
    next_handle: u64,
    paused: bool,
    /// The server reported no subscriptions; wait for the set to change.
    idle: bool,
    /// Ceiling imposed by the server, lifted on resume.
    throttle: Option<usize>,
    retry_after: Option<Duration>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!(
            min = self.settings.min_requests,
            max = self.settings.max_requests,
            "publish pipeline started"
        );
        self.replenish();

        loop {
            tokio::select! {
                Some(joined) = self.slots.join_next(), if !self.slots.is_empty() => {
                    self.on_slot(joined);
                }
                Some(joined) = self.republishes.join_next(), if !self.republishes.is_empty() => {
                    self.on_republish(joined);
                }
                command = commands.recv() => match command {
                    Some(Command::Close { drain_timeout, reply }) => {
                        let report = self.drain(drain_timeout).await;
                        let _ = reply.send(report);
                        return;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.drain(Duration::ZERO).await;
                        return;
                    }
                },
                () = self.ctx.registry.changed() => {
                    self.idle = false;
                }
            }
            self.replenish();
        }
    }

    fn target(&self) -> usize {
        let mut target = desired_outstanding(
            self.settings.min_requests,
            self.settings.max_requests,
            self.ctx.registry.len(),
        );
        if let Some(limit) = self.throttle {
            target = target.min(limit);
        }
        target
    }

    fn replenish(&mut self) {
        let target = self.target();
        self.counters.target.store(target, Ordering::Release);
        if self.in_flight.len() > target {
            self.shrink(target);
        }
        if !self.paused && !self.idle {
            while self.in_flight.len() < target {
                self.issue();
            }
        }
        self.counters
            .outstanding
            .store(self.in_flight.len(), Ordering::Release);
    }

    /// Cancels the newest requests until at most `target` remain.
    fn shrink(&mut self, target: usize) {
        let mut handles: Vec<u64> = self.in_flight.keys().copied().collect();
        handles.sort_unstable();
        let surplus = handles.len() - target;
        for handle in handles.into_iter().rev().take(surplus) {
            self.release(handle);
        }
        debug!(surplus, target, "publish pool shrunk");
    }

    /// Aborts a request and keeps its acknowledgements for the next one.
    fn release(&mut self, handle: u64) {
        if let Some(slot) = self.in_flight.remove(&handle) {
            slot.task.abort();
            self.tasks.remove(&slot.task.id());
            self.ctx.registry.restore_acks(&slot.acks);
            trace!(handle, "publish request cancelled");
        }
    }

    fn issue(&mut self) {
        let acks = AckBatch::from_vec(self.ctx.registry.take_acks());
        if !acks.is_empty() {
            trace!(count = acks.len(), "acknowledgements attached to publish request");
            self.ctx
                .dispatcher
                .emit(SessionEvent::AcknowledgementsQueued(acks.to_vec()));
        }

        let handle = self.next_handle;
        self.next_handle += 1;
        let delay = self.retry_after.take().unwrap_or_default();
        let channel = Arc::clone(&self.ctx.channel);
        let request = acks.clone();

        let task = self.slots.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = channel.publish(&request).await;
            SlotOutcome { handle, result }
        });
        self.tasks.insert(task.id(), handle);
        self.in_flight.insert(
            handle,
            Slot {
                issued_at: Instant::now(),
                episode: self.ctx.state.episode(),
                acks,
                task,
            },
        );
        trace!(handle, outstanding = self.in_flight.len(), "publish request issued");
    }

    fn on_slot(&mut self, joined: Result<SlotOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                let Some(handle) = self.tasks.remove(&err.id()) else {
                    return;
                };
                if err.is_panic() {
                    error!(handle, "publish request task panicked");
                }
                self.release(handle);
                return;
            }
        };
        let slot = self.in_flight.remove(&outcome.handle);
        if let Some(slot) = &slot {
            self.tasks.remove(&slot.task.id());
        }

        match (outcome.result, slot) {
            (Ok(response), slot) => {
                if let Some(slot) = slot {
                    trace!(
                        handle = outcome.handle,
                        elapsed_ms = slot.issued_at.elapsed().as_millis() as u64,
                        "publish request completed"
                    );
                }
                self.on_response(response);
            }
            (Err(fault), Some(slot)) => self.on_fault(fault, &slot),
            (Err(fault), None) => {
                trace!(
                    handle = outcome.handle,
                    fault = %fault,
                    "cancelled publish request failed"
                );
            }
        }
    }

    fn on_response(&mut self, response: PublishResponse) {
        self.ctx.monitor.lock().record_activity(Instant::now());
        let notification = response.notification;
        if notification.is_keep_alive() {
            trace!(
                subscription = %notification.subscription_id,
                "keep-alive notification"
            );
            return;
        }
        if response.more_notifications {
            trace!(subscription = %notification.subscription_id, "server has more notifications");
        }
        self.accept(notification);
    }

    fn accept(&mut self, notification: NotificationMessage) {
        let subscription_id = notification.subscription_id;
        let sequence_number = notification.sequence_number;
        let Some(Observation { update, observers }) =
            self.ctx.registry.observe(subscription_id, sequence_number)
        else {
            warn!(
                subscription = %subscription_id,
                sequence = %sequence_number,
                "notification for unknown subscription dropped"
            );
            return;
        };

        match update.class {
            SequenceClass::Duplicate => {
                debug!(
                    subscription = %subscription_id,
                    sequence = %sequence_number,
                    "duplicate notification suppressed"
                );
                return;
            }
            SequenceClass::InOrder => {}
            SequenceClass::OutOfOrder { missing } => {
                debug!(
                    subscription = %subscription_id,
                    sequence = %sequence_number,
                    missing,
                    "out-of-order notification"
                );
            }
            SequenceClass::Gap { lost } => {
                warn!(
                    subscription = %subscription_id,
                    sequence = %sequence_number,
                    lost,
                    "sequence gap exceeds outdated threshold"
                );
            }
        }

        if !update.lost.is_empty() {
            self.report_loss(subscription_id, update.lost, &observers);
        }
        for missing in update.republish {
            self.request_republish(subscription_id, missing);
        }

        self.ctx
            .dispatcher
            .emit(SessionEvent::Publish(notification.clone()));
        self.ctx
            .dispatcher
            .deliver(observers, SubscriptionEvent::Notification(notification));
    }

    fn report_loss(
        &self,
        subscription_id: SubscriptionId,
        lost: Vec<LostRange>,
        observers: &SubscriptionObservers,
    ) {
        let event = DataLossEvent {
            subscription_id,
            lost,
        };
        warn!(
            subscription = %subscription_id,
            count = event.count(),
            "notifications declared lost"
        );
        self.ctx
            .dispatcher
            .deliver(observers.clone(), SubscriptionEvent::DataLoss(event.clone()));
        self.ctx.dispatcher.emit(SessionEvent::DataLoss(event));
    }

    fn on_fault(&mut self, fault: ServiceFault, slot: &Slot) {
        self.ctx.registry.restore_acks(&slot.acks);
        let severity = fault.severity();
        self.ctx
            .dispatcher
            .emit(SessionEvent::PublishError(PublishErrorEvent {
                fault: fault.clone(),
                severity,
                acknowledgements_retained: slot.acks.len(),
            }));

        match severity {
            FaultSeverity::Transient => match fault {
                ServiceFault::TooManyPublishRequests => {
                    let limit = self.in_flight.len().max(1);
                    warn!(limit, "server limited outstanding publish requests");
                    self.throttle = Some(limit);
                }
                ServiceFault::NoSubscription => {
                    debug!("server reports no subscriptions; idling until the set changes");
                    self.idle = true;
                }
                fault => {
                    warn!(
                        fault = %fault,
                        retry_ms = self.settings.retry_delay.as_millis() as u64,
                        "publish request failed"
                    );
                    self.retry_after = Some(self.settings.retry_delay);
                }
            },
            FaultSeverity::SessionFatal | FaultSeverity::Unrecoverable => {
                if self.paused {
                    debug!(fault = %fault, "publish fault while paused");
                    return;
                }
                let current = self.ctx.state.episode();
                if slot.episode != current {
                    debug!(
                        fault = %fault,
                        episode = slot.episode,
                        current,
                        "fault from an earlier connection; replacing request"
                    );
                    return;
                }
                warn!(fault = %fault, "session-fatal publish fault; pausing pipeline");
                self.set_paused(true);
                let trigger = RecoveryTrigger::new(slot.episode, TriggerCause::Fault(fault));
                if self.ctx.triggers.send(trigger).is_err() {
                    debug!("no recovery supervisor listening");
                }
            }
        }
    }

    fn request_republish(
        &mut self,
        subscription_id: SubscriptionId,
        sequence_number: SequenceNumber,
    ) {
        debug!(
            subscription = %subscription_id,
            sequence = %sequence_number,
            "requesting republish"
        );
        let channel = Arc::clone(&self.ctx.channel);
        let timeout = self.settings.operation_timeout;
        self.republishes.spawn(async move {
            let result = match tokio::time::timeout(
                timeout,
                channel.republish(subscription_id, sequence_number),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ServiceFault::Timeout),
            };
            RepublishOutcome {
                subscription_id,
                sequence_number,
                result,
            }
        });
    }

    fn on_republish(&mut self, joined: Result<RepublishOutcome, JoinError>) {
        let Ok(outcome) = joined else {
            return;
        };
        match outcome.result {
            Ok(notification) => {
                self.ctx.monitor.lock().record_activity(Instant::now());
                self.accept(notification);
            }
            Err(fault) => {
                debug!(
                    subscription = %outcome.subscription_id,
                    sequence = %outcome.sequence_number,
                    fault = %fault,
                    "republish failed"
                );
                if let Some(observers) = self
                    .ctx
                    .registry
                    .mark_lost(outcome.subscription_id, outcome.sequence_number)
                {
                    let lost = vec![LostRange {
                        first: outcome.sequence_number,
                        last: outcome.sequence_number,
                    }];
                    self.report_loss(outcome.subscription_id, lost, &observers);
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Pause => self.set_paused(true),
            Command::Resume => {
                self.set_paused(false);
                self.throttle = None;
                self.idle = false;
                self.retry_after = None;
            }
            Command::Wake => self.idle = false,
            Command::Reconfigure(settings) => {
                debug!(
                    min = settings.min_requests,
                    max = settings.max_requests,
                    "publish pipeline reconfigured"
                );
                self.settings = settings;
            }
            Command::Close { .. } => {}
        }
    }

    fn set_paused(&mut self, paused: bool) {
        if self.paused != paused {
            debug!(paused, "publish pipeline pause state changed");
        }
        self.paused = paused;
        self.counters.paused.store(paused, Ordering::Release);
    }

    async fn drain(&mut self, drain_timeout: Duration) -> DrainReport {
        self.set_paused(true);
        let mut report = DrainReport::default();
        let deadline = Instant::now() + drain_timeout;

        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.slots.join_next()).await {
                Ok(Some(joined)) => {
                    if joined.is_ok() {
                        report.completed += 1;
                    }
                    self.on_slot(joined);
                }
                Ok(None) | Err(_) => break,
            }
        }

        self.slots.abort_all();
        while let Some(joined) = self.slots.join_next().await {
            match joined {
                Ok(outcome) => {
                    report.completed += 1;
                    self.on_slot(Ok(outcome));
                }
                Err(err) => {
                    if err.is_cancelled() && self.tasks.contains_key(&err.id()) {
                        report.cancelled += 1;
                    }
                    self.on_slot(Err(err));
                }
            }
        }
        self.republishes.abort_all();
        while self.republishes.join_next().await.is_some() {}

        for (_, slot) in self.in_flight.drain() {
            self.ctx.registry.restore_acks(&slot.acks);
        }
        self.tasks.clear();
        self.counters.outstanding.store(0, Ordering::Release);
        info!(
            completed = report.completed,
            cancelled = report.cancelled,
            "publish pipeline drained"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::registry::Subscription;
    use crate::sequence::SequenceThresholds;
    use crate::state::ConnectionState;
    use async_trait::async_trait;
    use ironua_core::notification::TransferResult;
    use ironua_core::types::{
        Credentials, ServerState, SessionId, SessionIdentity, SubscriptionSettings,
    };
    use ironua_transport::LoopbackChannel;

    struct Harness {
        channel: Arc<LoopbackChannel>,
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Arc<EventDispatcher>,
        state: Arc<StateCell>,
        pipeline: PipelineHandle,
        triggers: mpsc::UnboundedReceiver<RecoveryTrigger>,
    }

    /// Loopback channel whose first publish carrying acknowledgements panics.
    struct PanickingChannel {
        inner: Arc<LoopbackChannel>,
        armed: AtomicBool,
    }

    #[async_trait]
    impl SessionChannel for PanickingChannel {
        async fn connect(&self) -> Result<(), ServiceFault> {
            self.inner.connect().await
        }

        async fn create_session(
            &self,
            session_name: &str,
            requested_timeout: Duration,
        ) -> Result<SessionIdentity, ServiceFault> {
            self.inner
                .create_session(session_name, requested_timeout)
                .await
        }

        async fn activate(
            &self,
            session_id: &SessionId,
            credentials: &Credentials,
        ) -> Result<(), ServiceFault> {
            self.inner.activate(session_id, credentials).await
        }

        async fn publish(
            &self,
            acknowledgements: &[SubscriptionAcknowledgement],
        ) -> Result<PublishResponse, ServiceFault> {
            if !acknowledgements.is_empty() && self.armed.swap(false, Ordering::SeqCst) {
                panic!("publish transport failure");
            }
            self.inner.publish(acknowledgements).await
        }

        async fn republish(
            &self,
            subscription_id: SubscriptionId,
            sequence_number: SequenceNumber,
        ) -> Result<NotificationMessage, ServiceFault> {
            self.inner.republish(subscription_id, sequence_number).await
        }

        async fn create_subscription(
            &self,
            settings: &SubscriptionSettings,
        ) -> Result<SubscriptionId, ServiceFault> {
            self.inner.create_subscription(settings).await
        }

        async fn delete_subscriptions(
            &self,
            ids: &[SubscriptionId],
        ) -> Result<(), ServiceFault> {
            self.inner.delete_subscriptions(ids).await
        }

        async fn transfer_subscriptions(
            &self,
            ids: &[SubscriptionId],
            send_initial_values: bool,
        ) -> Result<Vec<TransferResult>, ServiceFault> {
            self.inner
                .transfer_subscriptions(ids, send_initial_values)
                .await
        }

        async fn read_server_state(&self) -> Result<ServerState, ServiceFault> {
            self.inner.read_server_state().await
        }

        async fn close(&self, delete_subscriptions: bool) -> Result<(), ServiceFault> {
            self.inner.close(delete_subscriptions).await
        }
    }

    fn sid(id: u32) -> SubscriptionId {
        SubscriptionId::new(id)
    }

    fn settings(min: usize, max: usize) -> PublishSettings {
        PublishSettings {
            min_requests: min,
            max_requests: max,
            retry_delay: Duration::from_millis(5),
            operation_timeout: Duration::from_secs(1),
        }
    }

    fn harness(subscriptions: &[u32], settings: PublishSettings) -> Harness {
        let channel = Arc::new(LoopbackChannel::new());
        harness_on(channel.clone(), channel, subscriptions, settings)
    }

    fn harness_on(
        transport: Arc<dyn SessionChannel>,
        channel: Arc<LoopbackChannel>,
        subscriptions: &[u32],
        settings: PublishSettings,
    ) -> Harness {
        let registry = Arc::new(SubscriptionRegistry::new(SequenceThresholds::default()));
        for id in subscriptions {
            registry
                .add(Subscription::new(sid(*id), SubscriptionSettings::default()))
                .unwrap();
        }
        let dispatcher = Arc::new(EventDispatcher::new());
        let state = Arc::new(StateCell::new(Arc::clone(&dispatcher)));
        let (tx, triggers) = mpsc::unbounded_channel();
        let context = PipelineContext {
            channel: transport,
            registry: Arc::clone(&registry),
            dispatcher: Arc::clone(&dispatcher),
            monitor: Arc::new(Mutex::new(KeepAliveMonitor::new(
                Duration::from_secs(5),
                Instant::now(),
            ))),
            state: Arc::clone(&state),
            triggers: tx,
        };
        let pipeline = PublishPipeline::spawn(context, settings);
        Harness {
            channel,
            registry,
            dispatcher,
            state,
            pipeline,
            triggers,
        }
    }

    fn record(dispatcher: &EventDispatcher, kind: EventKind) -> Arc<Mutex<Vec<SessionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        dispatcher.subscribe(kind, move |e| s.lock().push(e.clone()));
        seen
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(
                std::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn ack(id: u32, seq: u32) -> SubscriptionAcknowledgement {
        SubscriptionAcknowledgement::new(sid(id), SequenceNumber::new(seq))
    }

    #[test]
    fn test_desired_outstanding() {
        assert_eq!(desired_outstanding(1, 100, 0), 1);
        assert_eq!(desired_outstanding(1, 100, 7), 7);
        assert_eq!(desired_outstanding(3, 100, 1), 3);
        assert_eq!(desired_outstanding(1, 5, 12), 5);
        assert_eq!(desired_outstanding(1, 500, 250), 100);
        assert_eq!(desired_outstanding(0, 0, 0), 1);
    }

    #[test]
    fn test_default_settings_match_session_defaults() {
        let defaults = PublishSettings::default();
        assert_eq!(
            defaults,
            PublishSettings::from(&SessionConfig::new("defaults", "opc.tcp://localhost:4840"))
        );
        assert_eq!(defaults.min_requests, 1);
        assert_eq!(defaults.max_requests, MAX_PUBLISH_REQUESTS_CAP);
    }

    #[tokio::test]
    async fn test_pool_sized_to_subscriptions() {
        let h = harness(&[1, 2, 3], settings(1, 100));
        wait_until(|| h.channel.in_flight() == 3).await;
        assert_eq!(h.pipeline.target(), 3);
        assert_eq!(h.pipeline.outstanding(), 3);
    }

    #[tokio::test]
    async fn test_pool_grows_when_subscription_added() {
        let h = harness(&[1], settings(1, 100));
        wait_until(|| h.channel.in_flight() == 1).await;

        h.registry
            .add(Subscription::new(sid(2), SubscriptionSettings::default()))
            .unwrap();
        wait_until(|| h.channel.in_flight() == 2).await;
        assert_eq!(h.pipeline.target(), 2);
    }

    #[tokio::test]
    async fn test_pool_shrinks_when_subscriptions_removed() {
        let h = harness(&[1, 2, 3], settings(1, 100));
        wait_until(|| h.channel.in_flight() == 3).await;
        h.channel.push_notification(sid(1), 1, b"a");
        wait_until(|| h.channel.publish_count() == 4).await;

        h.registry.remove(sid(2)).unwrap();
        h.registry.remove(sid(3)).unwrap();
        wait_until(|| h.pipeline.outstanding() == 1).await;
        wait_until(|| h.channel.in_flight() == 1).await;

        assert_eq!(h.pipeline.target(), 1);
        assert_eq!(h.channel.publish_count(), 4);
        // the newest request carried the ack and was cancelled
        assert_eq!(h.registry.take_acks(), vec![ack(1, 1)]);
    }

    #[tokio::test]
    async fn test_completion_dispatched_and_acked_on_replacement() {
        let h = harness(&[1], settings(1, 100));
        let published = record(&h.dispatcher, EventKind::Publish);
        wait_until(|| h.channel.publish_count() == 1).await;

        h.channel.push_notification(sid(1), 1, b"a");
        wait_until(|| h.channel.publish_count() == 2).await;

        assert_eq!(h.channel.acknowledgements(), vec![vec![], vec![ack(1, 1)]]);
        assert!(h.dispatcher.flush(Duration::from_secs(1)));
        assert_eq!(published.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_is_not_acknowledged() {
        let h = harness(&[1], settings(1, 100));
        let published = record(&h.dispatcher, EventKind::Publish);
        wait_until(|| h.channel.publish_count() == 1).await;

        h.channel.push_keep_alive(sid(1), 1);
        wait_until(|| h.channel.publish_count() == 2).await;

        assert!(h.channel.acknowledged().is_empty());
        assert_eq!(h.registry.window(sid(1)).unwrap().last_acked(), SequenceNumber::ZERO);
        assert!(h.dispatcher.flush(Duration::from_secs(1)));
        assert!(published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_is_suppressed() {
        let h = harness(&[1], settings(1, 100));
        let published = record(&h.dispatcher, EventKind::Publish);
        wait_until(|| h.channel.publish_count() == 1).await;

        h.channel.push_notification(sid(1), 1, b"a");
        h.channel.push_notification(sid(1), 1, b"a");
        wait_until(|| h.channel.publish_count() == 3).await;

        assert!(h.dispatcher.flush(Duration::from_secs(1)));
        assert_eq!(published.lock().len(), 1);
        assert_eq!(h.channel.acknowledged(), vec![ack(1, 1)]);
    }

    #[tokio::test]
    async fn test_gap_reports_data_loss() {
        let h = harness(&[1], settings(1, 100));
        let losses = record(&h.dispatcher, EventKind::DataLoss);
        wait_until(|| h.channel.publish_count() == 1).await;

        h.channel.push_notification(sid(1), 1, b"a");
        h.channel.push_notification(sid(1), 150, b"b");
        wait_until(|| h.channel.publish_count() == 3).await;

        assert!(h.dispatcher.flush(Duration::from_secs(1)));
        let losses = losses.lock();
        assert_eq!(losses.len(), 1);
        match &losses[0] {
            SessionEvent::DataLoss(event) => assert_eq!(event.count(), 148),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            h.registry.window(sid(1)).unwrap().last_acked(),
            SequenceNumber::new(150)
        );
    }

    #[tokio::test]
    async fn test_wide_hole_is_republished() {
        let h = harness(&[1], settings(1, 100));
        let losses = record(&h.dispatcher, EventKind::DataLoss);
        for n in 2..=13 {
            h.channel.retain(NotificationMessage::new(
                sid(1),
                SequenceNumber::new(n),
                bytes::Bytes::from_static(b"r"),
            ));
        }
        wait_until(|| h.channel.publish_count() == 1).await;

        h.channel.push_notification(sid(1), 1, b"a");
        h.channel.push_notification(sid(1), 15, b"b");
        wait_until(|| {
            h.registry.window(sid(1)).unwrap().last_acked() == SequenceNumber::new(15)
        })
        .await;

        // 14 was not retained and is reported lost on its own
        assert_eq!(h.channel.call_count("republish"), 13);
        assert!(h.dispatcher.flush(Duration::from_secs(1)));
        let losses = losses.lock();
        assert_eq!(losses.len(), 1);
        match &losses[0] {
            SessionEvent::DataLoss(event) => {
                assert_eq!(event.lost[0].first, SequenceNumber::new(14));
                assert_eq!(event.count(), 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_small_hole_waits_without_republish() {
        let h = harness(&[1], settings(1, 100));
        wait_until(|| h.channel.publish_count() == 1).await;

        h.channel.push_notification(sid(1), 1, b"a");
        h.channel.push_notification(sid(1), 4, b"b");
        wait_until(|| h.channel.publish_count() == 3).await;

        assert_eq!(h.channel.call_count("republish"), 0);
        let window = h.registry.window(sid(1)).unwrap();
        assert_eq!(window.missing(), vec![SequenceNumber::new(2), SequenceNumber::new(3)]);

        h.channel.push_notification(sid(1), 2, b"c");
        h.channel.push_notification(sid(1), 3, b"d");
        wait_until(|| {
            h.registry.window(sid(1)).unwrap().last_acked() == SequenceNumber::new(4)
        })
        .await;
    }

    #[tokio::test]
    async fn test_transient_fault_restores_acks_and_retries() {
        let h = harness(&[1], settings(1, 100));
        let errors = record(&h.dispatcher, EventKind::PublishError);
        wait_until(|| h.channel.publish_count() == 1).await;

        h.channel.push_notification(sid(1), 1, b"a");
        wait_until(|| h.channel.publish_count() == 2).await;
        h.channel.push_fault(ServiceFault::Timeout);
        wait_until(|| h.channel.publish_count() == 3).await;

        assert_eq!(
            h.channel.acknowledgements(),
            vec![vec![], vec![ack(1, 1)], vec![ack(1, 1)]]
        );
        assert!(h.dispatcher.flush(Duration::from_secs(1)));
        match &errors.lock()[0] {
            SessionEvent::PublishError(event) => {
                assert_eq!(event.severity, FaultSeverity::Transient);
                assert_eq!(event.acknowledgements_retained, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!h.pipeline.is_paused());
    }

    #[tokio::test]
    async fn test_session_fatal_fault_pauses_and_signals_once() {
        let mut h = harness(&[1, 2], settings(1, 100));
        wait_until(|| h.channel.in_flight() == 2).await;

        h.channel.push_fault(ServiceFault::SessionIdInvalid);
        h.channel.push_fault(ServiceFault::SecureChannelClosed);
        wait_until(|| h.channel.in_flight() == 0).await;
        wait_until(|| h.pipeline.is_paused()).await;

        let trigger = h.triggers.recv().await.unwrap();
        assert!(matches!(trigger.cause, TriggerCause::Fault(_)));
        assert_eq!(trigger.episode, 0);
        assert!(h.triggers.try_recv().is_err());
        // no replacements while paused
        assert_eq!(h.channel.publish_count(), 2);

        h.pipeline.resume();
        wait_until(|| h.channel.in_flight() == 2).await;
    }

    #[tokio::test]
    async fn test_fatal_fault_from_earlier_connection_is_replaced() {
        let mut h = harness(&[1, 2], settings(1, 100));
        wait_until(|| h.channel.in_flight() == 2).await;

        h.state.transition(ConnectionState::Suspect).unwrap();
        h.state.transition(ConnectionState::Reconnecting).unwrap();
        h.state.transition(ConnectionState::Connected).unwrap();
        assert_eq!(h.state.episode(), 1);

        h.channel.push_fault(ServiceFault::SessionClosed);
        wait_until(|| h.channel.publish_count() == 3).await;
        wait_until(|| h.channel.in_flight() == 2).await;

        assert!(!h.pipeline.is_paused());
        assert_eq!(h.pipeline.outstanding(), 2);
        assert!(h.triggers.try_recv().is_err());

        // requests issued in the current connection still escalate
        h.channel.push_fault(ServiceFault::SessionIdInvalid);
        h.channel.push_fault(ServiceFault::SessionIdInvalid);
        let trigger = h.triggers.recv().await.unwrap();
        assert_eq!(trigger.episode, 1);
        wait_until(|| h.pipeline.is_paused()).await;
    }

    #[tokio::test]
    async fn test_panicked_request_keeps_acks() {
        let channel = Arc::new(LoopbackChannel::new());
        let transport = Arc::new(PanickingChannel {
            inner: channel.clone(),
            armed: AtomicBool::new(true),
        });
        let h = harness_on(transport, channel, &[1], settings(1, 100));
        wait_until(|| h.channel.publish_count() == 1).await;

        h.channel.push_notification(sid(1), 1, b"a");
        wait_until(|| h.channel.publish_count() == 2).await;

        // the panicked request never reached the server; its replacement
        // carries the same acknowledgement
        assert_eq!(h.channel.acknowledgements(), vec![vec![], vec![ack(1, 1)]]);
        assert_eq!(h.pipeline.outstanding(), 1);
        assert_eq!(h.registry.window(sid(1)).unwrap().pending_ack_count(), 0);
    }

    #[tokio::test]
    async fn test_too_many_requests_lowers_ceiling() {
        let h = harness(&[1, 2, 3, 4, 5], settings(1, 100));
        wait_until(|| h.channel.in_flight() == 5).await;

        h.channel.push_fault(ServiceFault::TooManyPublishRequests);
        wait_until(|| h.pipeline.target() == 4).await;
        assert_eq!(h.channel.in_flight(), 4);
        assert_eq!(h.channel.publish_count(), 5);

        h.pipeline.resume();
        wait_until(|| h.channel.in_flight() == 5).await;
    }

    #[tokio::test]
    async fn test_no_subscription_idles_until_change() {
        let h = harness(&[1], settings(1, 100));
        wait_until(|| h.channel.in_flight() == 1).await;

        h.channel.push_fault(ServiceFault::NoSubscription);
        wait_until(|| h.channel.in_flight() == 0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.channel.publish_count(), 1);

        h.registry
            .add(Subscription::new(sid(2), SubscriptionSettings::default()))
            .unwrap();
        wait_until(|| h.channel.in_flight() == 2).await;
    }

    #[tokio::test]
    async fn test_close_cancels_outstanding_requests() {
        let h = harness(&[1, 2], settings(1, 100));
        wait_until(|| h.channel.in_flight() == 2).await;

        let report = h.pipeline.close(Duration::from_millis(20)).await;
        assert_eq!(
            report,
            DrainReport {
                completed: 0,
                cancelled: 2
            }
        );
        assert_eq!(h.channel.in_flight(), 0);
        assert_eq!(h.pipeline.close(Duration::ZERO).await, DrainReport::default());
    }

    #[tokio::test]
    async fn test_close_keeps_acks_of_cancelled_requests() {
        let h = harness(&[1], settings(1, 100));
        wait_until(|| h.channel.publish_count() == 1).await;
        h.channel.push_notification(sid(1), 1, b"a");
        wait_until(|| h.channel.publish_count() == 2).await;

        h.pipeline.close(Duration::ZERO).await;
        assert_eq!(h.registry.take_acks(), vec![ack(1, 1)]);
    }

    #[tokio::test]
    async fn test_close_processes_completions_within_window() {
        let h = harness(&[1], settings(1, 100));
        let published = record(&h.dispatcher, EventKind::Publish);
        wait_until(|| h.channel.in_flight() == 1).await;

        let (report, ()) = tokio::join!(h.pipeline.close(Duration::from_millis(500)), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.channel.push_notification(sid(1), 1, b"a");
        });
        assert_eq!(report.completed, 1);
        assert_eq!(report.cancelled, 0);
        assert!(h.dispatcher.flush(Duration::from_secs(1)));
        assert_eq!(published.lock().len(), 1);
    }
}
