//! Resend-on-failure decorator
//!
//! Failed deliveries are parked in a bounded [`RetryQueue`] ordered by the
//! time they are due again. A single worker sleeps until the earliest entry
//! is due and re-submits it through the wrapped backend. Retries can reorder
//! samples relative to their creation time, which is why the decorator is
//! opt-in.

use super::{Backend, CallbackBackend, DeliveryCallback, Payload};
use crate::{
    config::RetryConfig,
    sample::{AdSample, Sample},
    Error, Result,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Decides whether and when a failed delivery is attempted again
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// `attempt` counts the deliveries already made for the payload
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        if attempt > self.config.max_retries {
            return false;
        }
        error.is_retryable()
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.config.delay_for_attempt(attempt)
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[derive(Debug)]
struct RetryEntry {
    payload: Payload,
    /// Deliveries already attempted
    attempts: u32,
    first_failed_at: Instant,
    due: Instant,
}

/// Payloads waiting to be re-sent, ordered by due time
#[derive(Debug)]
pub struct RetryQueue {
    entries: Vec<RetryEntry>,
    capacity: usize,
    max_age: Duration,
}

impl RetryQueue {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            max_age,
        }
    }

    /// Park a payload until `due`; on overflow the entry that failed first
    /// is evicted and returned.
    fn push(&mut self, entry: RetryEntry) -> Option<RetryEntry> {
        let index = self.entries.partition_point(|e| e.due <= entry.due);
        self.entries.insert(index, entry);

        if self.entries.len() <= self.capacity {
            return None;
        }
        let oldest = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.first_failed_at)
            .map(|(i, _)| i)?;
        Some(self.entries.remove(oldest))
    }

    /// Next entry due at `now`, skipping (and returning) expired ones
    fn pop_due(&mut self, now: Instant, expired: &mut Vec<RetryEntry>) -> Option<RetryEntry> {
        while self.entries.first().is_some_and(|e| e.due <= now) {
            let entry = self.entries.remove(0);
            if now.saturating_duration_since(entry.first_failed_at) > self.max_age {
                expired.push(entry);
                continue;
            }
            return Some(entry);
        }
        None
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.due)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct RetryShared<B> {
    inner: B,
    policy: RetryPolicy,
    queue: Mutex<RetryQueue>,
    wake: Notify,
}

impl<B: CallbackBackend + 'static> RetryShared<B> {
    fn queue(&self) -> MutexGuard<'_, RetryQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(self: &Arc<Self>, payload: Payload, attempts: u32, first_failed_at: Option<Instant>) {
        let shared = Arc::clone(self);
        let retained = payload.clone();
        let callback: DeliveryCallback = Box::new(move |result: Result<()>| {
            if let Err(error) = result {
                shared.on_failure(retained, error, attempts + 1, first_failed_at);
            }
        });
        self.inner.send_with_callback(payload, callback);
    }

    fn on_failure(&self, payload: Payload, error: Error, attempts: u32, first_failed_at: Option<Instant>) {
        if !self.policy.should_retry(&error, attempts) {
            warn!(
                kind = payload.kind(),
                attempts,
                code = error.error_code(),
                "Giving up on payload"
            );
            return;
        }

        let now = Instant::now();
        let delay = self.policy.delay_for_attempt(attempts);
        let entry = RetryEntry {
            payload,
            attempts,
            first_failed_at: first_failed_at.unwrap_or(now),
            due: now + delay,
        };
        debug!(attempts, delay_ms = delay.as_millis() as u64, "Scheduling resend");

        if let Some(evicted) = self.queue().push(entry) {
            warn!(
                kind = evicted.payload.kind(),
                attempts = evicted.attempts,
                "Retry queue full, dropping oldest payload"
            );
        }
        self.wake.notify_one();
    }

    async fn run(self: Arc<Self>) {
        loop {
            let next_due = self.queue().next_due();
            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = self.wake.notified() => continue,
                    }
                }
                None => {
                    self.wake.notified().await;
                    continue;
                }
            }

            let now = Instant::now();
            let mut expired = Vec::new();
            let mut due = Vec::new();
            {
                let mut queue = self.queue();
                while let Some(entry) = queue.pop_due(now, &mut expired) {
                    due.push(entry);
                }
            }

            for entry in expired {
                warn!(
                    kind = entry.payload.kind(),
                    attempts = entry.attempts,
                    "Payload too old to resend, dropping"
                );
            }
            for entry in due {
                debug!(kind = entry.payload.kind(), attempts = entry.attempts, "Resending payload");
                self.deliver(entry.payload, entry.attempts, Some(entry.first_failed_at));
            }
        }
    }
}

/// Backend decorator that re-sends failed deliveries with exponential backoff
pub struct RetryBackend<B> {
    shared: Arc<RetryShared<B>>,
    worker: JoinHandle<()>,
}

impl<B: CallbackBackend + 'static> RetryBackend<B> {
    pub fn new(inner: B, policy: RetryPolicy, handle: &Handle) -> Self {
        let queue = RetryQueue::new(
            policy.config().max_queued_samples,
            policy.config().max_sample_age(),
        );
        let shared = Arc::new(RetryShared {
            inner,
            policy,
            queue: Mutex::new(queue),
            wake: Notify::new(),
        });
        let worker = handle.spawn(shared.clone().run());
        Self { shared, worker }
    }

    /// Payloads currently waiting for a resend
    pub fn pending_retries(&self) -> usize {
        self.shared.queue().len()
    }

    fn submit(&self, payload: Payload) {
        self.shared.deliver(payload, 0, None);
    }
}

impl<B> Drop for RetryBackend<B> {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[async_trait]
impl<B: CallbackBackend + 'static> Backend for RetryBackend<B> {
    fn send(&self, sample: Sample) {
        self.submit(sample.into());
    }

    fn send_ad_sample(&self, sample: AdSample) {
        self.submit(sample.into());
    }

    /// Waits for first attempts only; parked retries are not awaited
    async fn flush(&self) {
        self.shared.inner.flush().await;
    }
}
