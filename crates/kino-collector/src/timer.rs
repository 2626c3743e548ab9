//! Cancellable one-shot and periodic timers on a tokio runtime
//!
//! Timers are owned handles: the state machine keeps each live timer in a
//! field and cancels it by dropping or calling [`Timer::cancel`]. A callback
//! that is already running when its timer is cancelled still completes, so
//! owners pair every timer with a generation number and ignore stale fires.

use crate::{Error, Result};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Spawns timers onto a runtime
#[derive(Debug, Clone)]
pub struct TimerService {
    handle: Handle,
}

impl TimerService {
    /// Create a timer service on an explicit runtime
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create a timer service on the runtime of the calling context
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| Error::NoRuntime)
    }

    /// Runtime handle timers are spawned on
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `f` once after `delay`
    pub fn schedule_once<F>(&self, delay: Duration, f: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let task = self.handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            f();
        });
        trace!(delay_ms = delay.as_millis() as u64, "One-shot timer scheduled");
        Timer { task }
    }

    /// Run `f` repeatedly; `next_delay(n)` gives the wait before tick `n`.
    ///
    /// Deadlines are chained from the previous deadline rather than from the
    /// moment the callback ran, so slow callbacks do not stretch the period.
    pub fn schedule_periodic<D, F>(&self, mut next_delay: D, mut f: F) -> Timer
    where
        D: FnMut(u32) -> Duration + Send + 'static,
        F: FnMut() + Send + 'static,
    {
        let mut deadline = Instant::now() + next_delay(0);
        let task = self.handle.spawn(async move {
            let mut tick: u32 = 0;
            loop {
                tokio::time::sleep_until(deadline).await;
                f();
                tick = tick.saturating_add(1);
                deadline += next_delay(tick);
            }
        });
        Timer { task }
    }
}

/// Handle to a scheduled timer; dropping it cancels the timer
#[derive(Debug)]
pub struct Timer {
    task: JoinHandle<()>,
}

impl Timer {
    /// Cancel the timer; pending fires will not run
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
