/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Session builder for fluent configuration.
//!
//! This module provides a builder pattern for establishing sessions.

use crate::session::{Established, Session, bounded_call};
use ironua_core::error::Result;
use ironua_core::types::{Credentials, SubscriptionSettings};
use ironua_session::config::SessionConfig;
use ironua_session::events::{EventKind, ObserverSet, SessionEvent};
use ironua_session::registry::{Subscription, SubscriptionRegistry, SubscriptionTemplate};
use ironua_transport::SessionChannel;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything needed to establish a session, without the connection.
///
/// Produced by [`Session::to_template`] and consumed by
/// [`SessionBuilder::from_template`].
#[derive(Clone)]
pub struct SessionTemplate {
    /// Session configuration.
    pub config: SessionConfig,
    /// User identity to activate with.
    pub credentials: Credentials,
    /// Subscriptions to create after activation.
    pub subscriptions: Vec<SubscriptionTemplate>,
    /// Session-level observers.
    pub observers: ObserverSet,
}

impl fmt::Debug for SessionTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTemplate")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .field("subscriptions", &self.subscriptions)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Builder for establishing a [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    credentials: Credentials,
    subscriptions: Vec<SubscriptionTemplate>,
    observers: ObserverSet,
}

impl SessionBuilder {
    /// Creates a new session builder.
    ///
    /// # Arguments
    /// * `config` - The session configuration
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            credentials: Credentials::Anonymous,
            subscriptions: Vec::new(),
            observers: ObserverSet::new(),
        }
    }

    /// Creates a builder that reproduces a captured session.
    #[must_use]
    pub fn from_template(template: SessionTemplate) -> Self {
        Self {
            config: template.config,
            credentials: template.credentials,
            subscriptions: template.subscriptions,
            observers: template.observers,
        }
    }

    /// Sets the user identity.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Adds a subscription to create once the session is active.
    #[must_use]
    pub fn with_subscription(self, settings: SubscriptionSettings) -> Self {
        self.with_subscription_template(SubscriptionTemplate::new(settings))
    }

    /// Adds a subscription together with its observers.
    #[must_use]
    pub fn with_subscription_template(mut self, template: SubscriptionTemplate) -> Self {
        self.subscriptions.push(template);
        self
    }

    /// Registers a session-level observer.
    #[must_use]
    pub fn with_observer<F>(mut self, kind: EventKind, observer: F) -> Self
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.observers.insert(kind, Arc::new(observer));
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the subscriptions that will be created.
    #[must_use]
    pub fn subscriptions(&self) -> &[SubscriptionTemplate] {
        &self.subscriptions
    }

    /// Returns the number of registered session-level observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Connects, creates and activates the session, then creates every
    /// subscription and starts the keep-alive timer and publish pipeline.
    ///
    /// # Arguments
    /// * `channel` - The service channel to the server
    ///
    /// # Errors
    /// Returns `UaError::Config` for an invalid configuration, `UaError::Fault`
    /// if a service call fails and `UaError::Session` if one times out.
    pub async fn connect(self, channel: Arc<dyn SessionChannel>) -> Result<Session> {
        self.config.validate()?;
        let operation_timeout = self.config.operation_timeout;

        info!(
            endpoint = %self.config.endpoint_url,
            session = %self.config.session_name,
            "establishing session"
        );

        bounded_call("connect", self.config.reconnect_timeout, channel.connect()).await?;
        let identity = bounded_call(
            "create_session",
            operation_timeout,
            channel.create_session(&self.config.session_name, self.config.session_timeout),
        )
        .await?;
        bounded_call(
            "activate",
            operation_timeout,
            channel.activate(&identity.session_id, &self.credentials),
        )
        .await?;

        let registry = SubscriptionRegistry::new(self.config.sequence_thresholds);
        for template in self.subscriptions {
            let created = bounded_call(
                "create_subscription",
                operation_timeout,
                channel.create_subscription(&template.settings),
            )
            .await;
            let id = match created {
                Ok(id) => id,
                Err(err) => {
                    warn!(error = %err, "subscription setup failed, closing session");
                    let _ = bounded_call("close", operation_timeout, channel.close(true)).await;
                    return Err(err);
                }
            };
            registry.add(Subscription::from_template(id, template))?;
        }

        info!(
            session_id = %identity.session_id,
            subscriptions = registry.len(),
            "session established"
        );

        Ok(Session::start(Established {
            config: self.config,
            channel,
            identity,
            credentials: self.credentials,
            registry,
            observers: self.observers,
        }))
    }
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .field("subscriptions", &self.subscriptions)
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironua_core::error::{ServiceFault, SessionError, UaError};
    use ironua_core::types::SubscriptionId;
    use ironua_session::state::ConnectionState;
    use ironua_transport::LoopbackChannel;
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig::new("builder", "opc.tcp://localhost:4840")
    }

    #[test]
    fn test_builder_defaults() {
        let builder = SessionBuilder::new(config());
        assert_eq!(builder.config().session_name, "builder");
        assert!(builder.subscriptions().is_empty());
        assert_eq!(builder.observer_count(), 0);
    }

    #[test]
    fn test_builder_collects_setup() {
        let builder = SessionBuilder::new(config())
            .with_credentials(Credentials::UserName {
                user: "operator".to_string(),
                password: "secret".to_string(),
            })
            .with_subscription(SubscriptionSettings::default())
            .with_subscription(SubscriptionSettings::new(Duration::from_millis(250)))
            .with_observer(EventKind::Publish, |_| {});

        assert_eq!(builder.subscriptions().len(), 2);
        assert_eq!(
            builder.subscriptions()[1].settings.publishing_interval,
            Duration::from_millis(250)
        );
        assert_eq!(builder.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_establishes_session() {
        let channel = Arc::new(LoopbackChannel::new());
        let session = SessionBuilder::new(config())
            .with_subscription(SubscriptionSettings::default())
            .with_subscription(SubscriptionSettings::default())
            .connect(channel.clone())
            .await
            .unwrap();

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.session_id().as_str(), "builder-1");
        assert_eq!(
            session.subscriptions().iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![SubscriptionId::new(1), SubscriptionId::new(2)]
        );
        assert_eq!(
            &channel.calls()[..5],
            &[
                "connect",
                "create_session",
                "activate",
                "create_subscription",
                "create_subscription"
            ]
        );

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let channel = Arc::new(LoopbackChannel::new());
        let result = SessionBuilder::new(config().with_publish_requests(5, 2))
            .connect(channel.clone())
            .await;

        assert!(matches!(result, Err(UaError::Config(_))));
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn test_connect_fault_propagates() {
        let channel = Arc::new(LoopbackChannel::new());
        channel.set_connect_fault(Some(ServiceFault::CertificateInvalid("expired".into())));

        let result = SessionBuilder::new(config()).connect(channel).await;

        assert!(matches!(
            result,
            Err(UaError::Fault(ServiceFault::CertificateInvalid(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let channel = Arc::new(LoopbackChannel::new());
        channel.set_connect_delay(Some(Duration::from_secs(60)));

        let result = SessionBuilder::new(config()).connect(channel).await;

        assert!(matches!(
            result,
            Err(UaError::Session(SessionError::Timeout {
                operation: "connect",
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_failed_subscription_closes_session() {
        let channel = Arc::new(LoopbackChannel::new());
        channel.set_create_subscription_fault(Some(ServiceFault::Other {
            code: 0x8000_0000,
            reason: "too many subscriptions".to_string(),
        }));

        let result = SessionBuilder::new(config())
            .with_subscription(SubscriptionSettings::default())
            .connect(channel.clone())
            .await;

        assert!(matches!(result, Err(UaError::Fault(ServiceFault::Other { .. }))));
        assert_eq!(channel.closed_with(), Some(true));
    }
}
