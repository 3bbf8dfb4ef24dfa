/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Keep-alive deadline tracking.
//!
//! This module decides when a session has gone silent:
//! - Any publish completion or explicit keep-alive response counts as activity
//! - The deadline is `last_activity + interval + guard band`
//! - A missed deadline raises a suspect signal once per episode
//!
//! The monitor is driven by explicit (tokio) `Instant`s so the timing logic can
//! be tested without sleeping and follows a paused test clock. The recurring
//! tick itself comes from [`crate::timer::RecurringTimer`].

use std::time::Duration;
use tokio::time::Instant;

/// Fixed margin added to the keep-alive deadline to absorb network jitter.
pub const KEEP_ALIVE_GUARD_BAND: Duration = Duration::from_secs(1);

/// Outcome of a keep-alive tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveCheck {
    /// The deadline has not passed.
    Healthy {
        /// Time left until the deadline.
        remaining: Duration,
    },
    /// The deadline passed; raised once per suspect episode.
    Suspect {
        /// Time elapsed since the last activity.
        silent_for: Duration,
    },
    /// The session was already suspect at a previous tick.
    AlreadySuspect,
}

/// Tracks the deadline by which some server response must arrive.
#[derive(Debug)]
pub struct KeepAliveMonitor {
    /// Keep-alive interval.
    interval: Duration,
    /// Time of the most recent server activity.
    last_activity: Instant,
    /// Time the current suspect episode started, if any.
    suspect_since: Option<Instant>,
}

impl KeepAliveMonitor {
    /// Creates a new monitor whose clock starts at `now`.
    ///
    /// # Arguments
    /// * `interval` - The keep-alive interval
    /// * `now` - The start of the first deadline period
    #[must_use]
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_activity: now,
            suspect_since: None,
        }
    }

    /// Records server activity observed at `at`.
    ///
    /// Older timestamps than the current one are ignored, so completions that
    /// are processed late never move the deadline backwards. Activity does not
    /// end a suspect episode; only [`Self::resume`] does.
    pub fn record_activity(&mut self, at: Instant) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    /// Evaluates the deadline at `now`.
    pub fn check(&mut self, now: Instant) -> KeepAliveCheck {
        if self.suspect_since.is_some() {
            return KeepAliveCheck::AlreadySuspect;
        }

        let deadline = self.deadline();
        if now > deadline {
            self.suspect_since = Some(now);
            KeepAliveCheck::Suspect {
                silent_for: now.saturating_duration_since(self.last_activity),
            }
        } else {
            KeepAliveCheck::Healthy {
                remaining: deadline.saturating_duration_since(now),
            }
        }
    }

    /// Returns true if the server has been silent for at least one interval.
    ///
    /// The session uses this to decide whether to send an explicit keep-alive read.
    #[must_use]
    pub fn is_idle(&self, now: Instant) -> bool {
        self.suspect_since.is_none()
            && now.saturating_duration_since(self.last_activity) >= self.interval
    }

    /// Ends a suspect episode and restarts the deadline at `now`.
    pub fn resume(&mut self, now: Instant) {
        self.suspect_since = None;
        self.last_activity = now;
    }

    /// Returns the current deadline.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.last_activity + self.interval + KEEP_ALIVE_GUARD_BAND
    }

    /// Returns true while a suspect episode is open.
    #[must_use]
    pub const fn is_suspect(&self) -> bool {
        self.suspect_since.is_some()
    }

    /// Returns the time of the last recorded activity.
    #[must_use]
    pub const fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Returns the keep-alive interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Changes the keep-alive interval; the next check uses the new deadline.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_tick_before_deadline_is_healthy() {
        let t0 = Instant::now();
        let mut monitor = KeepAliveMonitor::new(Duration::from_secs(5), t0);

        let check = monitor.check(t0 + secs(4.0));
        assert_eq!(
            check,
            KeepAliveCheck::Healthy {
                remaining: Duration::from_secs(2)
            }
        );
        assert!(!monitor.is_suspect());
    }

    #[test]
    fn test_missed_deadline_raises_once() {
        let t0 = Instant::now();
        let mut monitor = KeepAliveMonitor::new(Duration::from_secs(5), t0);

        assert_eq!(
            monitor.check(t0 + secs(6.5)),
            KeepAliveCheck::Suspect {
                silent_for: secs(6.5)
            }
        );
        assert_eq!(monitor.check(t0 + secs(7.5)), KeepAliveCheck::AlreadySuspect);
        assert_eq!(monitor.check(t0 + secs(12.5)), KeepAliveCheck::AlreadySuspect);
    }

    #[test]
    fn test_activity_moves_deadline() {
        let t0 = Instant::now();
        let mut monitor = KeepAliveMonitor::new(Duration::from_secs(5), t0);

        monitor.record_activity(t0 + secs(3.0));
        assert!(matches!(
            monitor.check(t0 + secs(8.5)),
            KeepAliveCheck::Healthy { .. }
        ));

        // late completion processed after a newer one
        monitor.record_activity(t0 + secs(1.0));
        assert_eq!(monitor.last_activity(), t0 + secs(3.0));
    }

    #[test]
    fn test_resume_restarts_clock() {
        let t0 = Instant::now();
        let mut monitor = KeepAliveMonitor::new(Duration::from_secs(5), t0);
        assert!(matches!(
            monitor.check(t0 + secs(7.0)),
            KeepAliveCheck::Suspect { .. }
        ));

        // activity alone does not end the episode
        monitor.record_activity(t0 + secs(7.5));
        assert_eq!(monitor.check(t0 + secs(8.0)), KeepAliveCheck::AlreadySuspect);

        monitor.resume(t0 + secs(10.0));
        assert!(!monitor.is_suspect());
        assert!(matches!(
            monitor.check(t0 + secs(15.0)),
            KeepAliveCheck::Healthy { .. }
        ));
        assert!(matches!(
            monitor.check(t0 + secs(16.5)),
            KeepAliveCheck::Suspect { .. }
        ));
    }

    #[test]
    fn test_idle_detection() {
        let t0 = Instant::now();
        let mut monitor = KeepAliveMonitor::new(Duration::from_secs(5), t0);
        assert!(!monitor.is_idle(t0 + secs(4.9)));
        assert!(monitor.is_idle(t0 + secs(5.0)));

        monitor.set_interval(Duration::from_secs(10));
        assert!(!monitor.is_idle(t0 + secs(5.0)));
        assert_eq!(monitor.deadline(), t0 + secs(11.0));
    }
}
