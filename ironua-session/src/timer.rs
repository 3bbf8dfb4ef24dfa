/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Recurring timer capability.
//!
//! The keep-alive monitor only needs "call me every period". [`RecurringTimer`]
//! captures that with start/stop/reset; [`TokioTimer`] is the implementation
//! backed by a tokio task.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

/// Callback invoked on every tick. Must return quickly.
pub type TickFn = Arc<dyn Fn() + Send + Sync>;

/// A timer that invokes a callback at a fixed period.
pub trait RecurringTimer: Send + Sync {
    /// Starts ticking, replacing any previous schedule.
    fn start(&self, period: Duration, on_tick: TickFn);

    /// Stops ticking. A stopped timer can be started again.
    fn stop(&self);

    /// Restarts the countdown with a new period, keeping the callback.
    fn reset(&self, period: Duration);

    /// Returns true while the timer is ticking.
    fn is_running(&self) -> bool;
}

/// Recurring timer running on a tokio runtime.
pub struct TokioTimer {
    handle: Handle,
    inner: Mutex<TimerInner>,
}

struct TimerInner {
    task: Option<JoinHandle<()>>,
    on_tick: Option<TickFn>,
}

impl TokioTimer {
    /// Creates a stopped timer that will spawn its task on `handle`.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            inner: Mutex::new(TimerInner {
                task: None,
                on_tick: None,
            }),
        }
    }

    fn spawn(&self, inner: &mut TimerInner, period: Duration) {
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        let Some(on_tick) = inner.on_tick.clone() else {
            return;
        };
        inner.task = Some(self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                trace!("timer tick");
                on_tick();
            }
        }));
    }
}

impl RecurringTimer for TokioTimer {
    fn start(&self, period: Duration, on_tick: TickFn) {
        let mut inner = self.inner.lock();
        inner.on_tick = Some(on_tick);
        self.spawn(&mut inner, period);
    }

    fn stop(&self) {
        if let Some(task) = self.inner.lock().task.take() {
            task.abort();
        }
    }

    fn reset(&self, period: Duration) {
        let mut inner = self.inner.lock();
        self.spawn(&mut inner, period);
    }

    fn is_running(&self) -> bool {
        self.inner
            .lock()
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TokioTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioTimer")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, TickFn) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let on_tick: TickFn = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, on_tick)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_at_period() {
        let timer = TokioTimer::new(Handle::current());
        let (count, on_tick) = counting();

        timer.start(Duration::from_millis(100), on_tick);
        assert!(timer.is_running());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_stop() {
        let timer = TokioTimer::new(Handle::current());
        let (count, on_tick) = counting();

        timer.start(Duration::from_millis(100), on_tick);
        tokio::time::sleep(Duration::from_millis(150)).await;
        timer.stop();
        assert!(!timer.is_running());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_reset_restarts_countdown() {
        let timer = TokioTimer::new(Handle::current());
        let (count, on_tick) = counting();

        timer.start(Duration::from_millis(100), on_tick);
        tokio::time::sleep(Duration::from_millis(90)).await;
        timer.reset(Duration::from_millis(200));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
