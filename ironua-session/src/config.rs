/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Session configuration.
//!
//! This module provides configuration options for sessions. A configuration is
//! immutable for the lifetime of a session except for the fields accepted by
//! [`SessionConfig::apply_update`].

use crate::sequence::SequenceThresholds;
use ironua_core::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard ceiling on outstanding publish requests.
pub const MAX_PUBLISH_REQUESTS_CAP: usize = 100;

/// Configuration for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Human-readable session name sent on creation.
    pub session_name: String,
    /// Server endpoint, used for logging only.
    pub endpoint_url: String,
    /// Requested server-side session timeout.
    pub session_timeout: Duration,
    /// Keep-alive monitor period and deadline.
    pub keep_alive_interval: Duration,
    /// Minimum number of outstanding publish requests.
    pub min_publish_requests: usize,
    /// Maximum number of outstanding publish requests (capped at 100).
    pub max_publish_requests: usize,
    /// Whether subscriptions are transferred when the session is reactivated.
    pub transfer_subscriptions_on_reconnect: bool,
    /// Whether subscriptions are deleted when the session closes.
    pub delete_subscriptions_on_close: bool,
    /// Deadline for a single reconnect attempt.
    pub reconnect_timeout: Duration,
    /// Deadline for individual service calls made by the session itself.
    pub operation_timeout: Duration,
    /// Period of automatic reconnect attempts; `None` leaves retries to the caller.
    pub reconnect_period: Option<Duration>,
    /// Delay before a publish request replacing a failed one is issued.
    pub publish_retry_delay: Duration,
    /// Sequence validation thresholds.
    pub sequence_thresholds: SequenceThresholds,
}

impl SessionConfig {
    /// Creates a new session configuration with default timings.
    ///
    /// # Arguments
    /// * `session_name` - The session name
    /// * `endpoint_url` - The server endpoint
    #[must_use]
    pub fn new(session_name: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            endpoint_url: endpoint_url.into(),
            session_timeout: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(5),
            min_publish_requests: 1,
            max_publish_requests: MAX_PUBLISH_REQUESTS_CAP,
            transfer_subscriptions_on_reconnect: true,
            delete_subscriptions_on_close: true,
            reconnect_timeout: Duration::from_secs(15),
            operation_timeout: Duration::from_secs(10),
            reconnect_period: None,
            publish_retry_delay: Duration::from_millis(100),
            sequence_thresholds: SequenceThresholds::default(),
        }
    }

    /// Sets the keep-alive interval.
    #[must_use]
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Sets the minimum and maximum outstanding publish requests.
    #[must_use]
    pub const fn with_publish_requests(mut self, min: usize, max: usize) -> Self {
        self.min_publish_requests = min;
        self.max_publish_requests = max;
        self
    }

    /// Sets whether subscriptions are transferred on reconnect.
    #[must_use]
    pub const fn with_transfer_on_reconnect(mut self, transfer: bool) -> Self {
        self.transfer_subscriptions_on_reconnect = transfer;
        self
    }

    /// Sets whether subscriptions are deleted on close.
    #[must_use]
    pub const fn with_delete_subscriptions_on_close(mut self, delete: bool) -> Self {
        self.delete_subscriptions_on_close = delete;
        self
    }

    /// Sets the reconnect timeout.
    #[must_use]
    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    /// Sets the operation timeout.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Enables automatic reconnect attempts at the given period.
    #[must_use]
    pub fn with_reconnect_period(mut self, period: Duration) -> Self {
        self.reconnect_period = Some(period);
        self
    }

    /// Sets the delay before replacing a failed publish request.
    #[must_use]
    pub fn with_publish_retry_delay(mut self, delay: Duration) -> Self {
        self.publish_retry_delay = delay;
        self
    }

    /// Sets the sequence validation thresholds.
    #[must_use]
    pub const fn with_sequence_thresholds(mut self, thresholds: SequenceThresholds) -> Self {
        self.sequence_thresholds = thresholds;
        self
    }

    /// Returns the effective ceiling on outstanding publish requests.
    #[must_use]
    pub fn publish_ceiling(&self) -> usize {
        self.max_publish_requests.clamp(1, MAX_PUBLISH_REQUESTS_CAP)
    }

    /// Checks the configuration for values the session cannot run with.
    ///
    /// # Errors
    /// Returns `ConfigError` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_name.is_empty() {
            return Err(ConfigError::MissingField("session_name"));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "keep_alive_interval",
                reason: "must be greater than zero".into(),
            });
        }
        if self.reconnect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "reconnect_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_publish_requests == 0 || self.max_publish_requests > MAX_PUBLISH_REQUESTS_CAP
        {
            return Err(ConfigError::InvalidValue {
                field: "max_publish_requests",
                reason: format!("must be between 1 and {MAX_PUBLISH_REQUESTS_CAP}"),
            });
        }
        if self.min_publish_requests > self.max_publish_requests {
            return Err(ConfigError::InvalidValue {
                field: "min_publish_requests",
                reason: "must not exceed max_publish_requests".into(),
            });
        }
        if self.reconnect_period.is_some_and(|p| p.is_zero()) {
            return Err(ConfigError::InvalidValue {
                field: "reconnect_period",
                reason: "must be greater than zero".into(),
            });
        }
        self.sequence_thresholds.validate()
    }

    /// Applies a runtime update, returning the resulting configuration.
    ///
    /// Only the fields present in [`ConfigUpdate`] may change while a session runs.
    ///
    /// # Errors
    /// Returns `ConfigError` if the updated configuration is invalid.
    pub fn apply_update(&self, update: &ConfigUpdate) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(interval) = update.keep_alive_interval {
            next.keep_alive_interval = interval;
        }
        if let Some(min) = update.min_publish_requests {
            next.min_publish_requests = min;
        }
        if let Some(max) = update.max_publish_requests {
            next.max_publish_requests = max;
        }
        if let Some(period) = update.reconnect_period {
            next.reconnect_period = period;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Fields of a [`SessionConfig`] that may change while the session runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    /// New keep-alive interval.
    pub keep_alive_interval: Option<Duration>,
    /// New minimum outstanding publish requests.
    pub min_publish_requests: Option<usize>,
    /// New maximum outstanding publish requests.
    pub max_publish_requests: Option<usize>,
    /// New automatic reconnect period (`Some(None)` disables it).
    pub reconnect_period: Option<Option<Duration>>,
}

/// Builder for session configuration.
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    session_name: Option<String>,
    endpoint_url: Option<String>,
    keep_alive_interval: Option<Duration>,
    publish_requests: Option<(usize, usize)>,
    reconnect_timeout: Option<Duration>,
    reconnect_period: Option<Duration>,
    transfer_on_reconnect: Option<bool>,
    delete_on_close: Option<bool>,
    sequence_thresholds: Option<SequenceThresholds>,
}

impl SessionConfigBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the session name.
    #[must_use]
    pub fn session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    /// Sets the endpoint URL.
    #[must_use]
    pub fn endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Sets the keep-alive interval.
    #[must_use]
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    /// Sets the minimum and maximum outstanding publish requests.
    #[must_use]
    pub const fn publish_requests(mut self, min: usize, max: usize) -> Self {
        self.publish_requests = Some((min, max));
        self
    }

    /// Sets the reconnect timeout.
    #[must_use]
    pub fn reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = Some(timeout);
        self
    }

    /// Enables automatic reconnect at the given period.
    #[must_use]
    pub fn reconnect_period(mut self, period: Duration) -> Self {
        self.reconnect_period = Some(period);
        self
    }

    /// Sets whether subscriptions are transferred on reconnect.
    #[must_use]
    pub const fn transfer_on_reconnect(mut self, transfer: bool) -> Self {
        self.transfer_on_reconnect = Some(transfer);
        self
    }

    /// Sets whether subscriptions are deleted on close.
    #[must_use]
    pub const fn delete_subscriptions_on_close(mut self, delete: bool) -> Self {
        self.delete_on_close = Some(delete);
        self
    }

    /// Sets the sequence validation thresholds.
    #[must_use]
    pub const fn sequence_thresholds(mut self, thresholds: SequenceThresholds) -> Self {
        self.sequence_thresholds = Some(thresholds);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    /// Returns `ConfigError` if a required field is missing or a value is invalid.
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let name = self
            .session_name
            .ok_or(ConfigError::MissingField("session_name"))?;
        let endpoint = self
            .endpoint_url
            .ok_or(ConfigError::MissingField("endpoint_url"))?;

        let mut config = SessionConfig::new(name, endpoint);

        if let Some(interval) = self.keep_alive_interval {
            config.keep_alive_interval = interval;
        }
        if let Some((min, max)) = self.publish_requests {
            config.min_publish_requests = min;
            config.max_publish_requests = max;
        }
        if let Some(timeout) = self.reconnect_timeout {
            config.reconnect_timeout = timeout;
        }
        config.reconnect_period = self.reconnect_period;
        if let Some(transfer) = self.transfer_on_reconnect {
            config.transfer_subscriptions_on_reconnect = transfer;
        }
        if let Some(delete) = self.delete_on_close {
            config.delete_subscriptions_on_close = delete;
        }
        if let Some(thresholds) = self.sequence_thresholds {
            config.sequence_thresholds = thresholds;
        }

        config.validate()?;
        Ok(config)
    }
}
