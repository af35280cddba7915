//! Cancellable scheduled tasks.
//!
//! A [`Timer`] owns at most one spawned task.  Arming it again replaces the
//! previous task, so a state machine holding a `Timer` never ends up with
//! two pending callbacks for the same purpose.

use std::future::Future;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

#[derive(Debug, Default)]
pub struct Timer {
    handle: Option<AbortHandle>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once, `delay` after this call. A zero delay skips the sleep.
    pub fn arm<F>(&mut self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let deadline = Instant::now() + delay;
        let join = tokio::spawn(async move {
            if !delay.is_zero() {
                sleep_until(deadline).await;
            }
            task.await;
        });
        self.handle = Some(join.abort_handle());
    }

    /// Run `tick` right away and then every `period` until cancelled.
    pub fn arm_repeating<F, Fut>(&mut self, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let start = Instant::now();
        let join = tokio::spawn(async move {
            let mut ticks = interval_at(start, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                tick().await;
            }
        });
        self.handle = Some(join.abort_handle());
    }

    /// Idempotent: cancelling a fired or already cancelled timer is a no-op.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
