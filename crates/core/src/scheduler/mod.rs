//! Cooperative scheduling of ticks and delayed work.
//!
//! Everything runs on one thread: [`LocalScheduler`] spawns onto the current
//! `tokio::task::LocalSet`, so tasks need not be `Send` and never run
//! concurrently with each other. Under a paused tokio clock the same code is
//! fully deterministic, which is how the session tests drive it.

use std::{fmt, future::Future, pin::Pin, time::Duration};

use tokio::{
    task::AbortHandle,
    time::{Instant, MissedTickBehavior},
};

/// A boxed future run on the local task set.
pub type LocalTask = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Source of time and of cancellable periodic or delayed work.
pub trait Scheduler {
    fn now(&self) -> Instant;

    /// Runs `tick` immediately and then every `period` until cancelled.
    /// Ticks that fall behind are skipped rather than bunched up.
    fn schedule_repeating(
        &self,
        name: &'static str,
        period: Duration,
        tick: Box<dyn FnMut() + 'static>,
    ) -> TaskHandle;

    /// Runs `task` once after `delay` unless cancelled first.
    fn schedule_after(&self, name: &'static str, delay: Duration, task: LocalTask) -> TaskHandle;

    /// A future that completes after `duration` of scheduler time.
    fn sleep(&self, duration: Duration) -> LocalTask;
}

/// Cancellation handle for a scheduled task. Dropping it cancels the task.
pub struct TaskHandle {
    name: &'static str,
    abort: Option<AbortHandle>,
}

impl TaskHandle {
    pub fn new(name: &'static str, abort: AbortHandle) -> Self {
        Self {
            name,
            abort: Some(abort),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stops the task. Work already inside a tick completes, nothing after it
    /// runs. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
            tracing::trace!(task = self.name, "task cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.abort.is_none()
    }

    /// Whether the task has run to completion or been torn down.
    pub fn is_finished(&self) -> bool {
        self.abort
            .as_ref()
            .map(AbortHandle::is_finished)
            .unwrap_or(true)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// [`Scheduler`] backed by tokio timers and `spawn_local`.
///
/// Must be used from within a `LocalSet`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalScheduler;

impl LocalScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for LocalScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule_repeating(
        &self,
        name: &'static str,
        period: Duration,
        mut tick: Box<dyn FnMut() + 'static>,
    ) -> TaskHandle {
        let handle = tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                tick();
            }
        });
        tracing::trace!(task = name, ?period, "repeating task scheduled");
        TaskHandle::new(name, handle.abort_handle())
    }

    fn schedule_after(&self, name: &'static str, delay: Duration, task: LocalTask) -> TaskHandle {
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        tracing::trace!(task = name, ?delay, "delayed task scheduled");
        TaskHandle::new(name, handle.abort_handle())
    }

    fn sleep(&self, duration: Duration) -> LocalTask {
        Box::pin(tokio::time::sleep(duration))
    }
}
