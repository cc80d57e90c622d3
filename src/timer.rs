//! Cancellable background tasks
//!
//! Seek-mute clears, ramp steps, reconnect backoff and the fallback poll all
//! run as independent tokio tasks. A [`TimerHandle`] owns at most one of them;
//! cancelling is idempotent, so cancelling a fired or already cancelled timer
//! is a no-op.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Handle to a single-shot or periodic background task
#[derive(Debug, Default)]
pub struct TimerHandle {
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// A handle that owns nothing
    pub fn idle() -> Self {
        Self { task: None }
    }

    /// Run `action` once after `delay`
    pub fn once<F, Fut>(delay: Duration, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action().await;
        });
        Self { task: Some(task) }
    }

    /// Run `action` every `period`, first tick immediately
    pub fn every<F, Fut>(period: Duration, mut action: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                action().await;
            }
        });
        Self { task: Some(task) }
    }

    /// Wrap an already spawned task
    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// Replace the owned task, cancelling the previous one
    pub fn replace(&mut self, other: TimerHandle) {
        self.cancel();
        *self = other;
    }

    /// Cancel the task. Safe to call any number of times.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                trace!("Cancelling pending timer");
            }
            task.abort();
        }
    }

    /// True while the task has been scheduled and has neither fired nor been cancelled
    pub fn is_pending(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
