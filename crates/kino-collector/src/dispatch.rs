//! Sample dispatch pipeline
//!
//! Numbers samples and holds them back until the license is authorized.
//!
//! ```text
//!   Disabled ──enable()──▶ PendingAuthorization ──granted──▶ Enabled
//!      ▲                         │                              │
//!      │                         └──denied──▶ Denied            │
//!      └──────────────────────── disable() ◀────────────────────┘
//! ```
//!
//! `add()` and the drain that follows a successful authorization share one
//! lock, so a sample is either still queued or already handed to the
//! backend, never both.

use crate::{
    backend::Backend,
    license::{AuthorizationResult, LicenseProvider},
    sample::{AdSample, Sample},
    Result,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Authorization state of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Disabled,
    PendingAuthorization,
    Enabled,
    /// The license was refused or could not be checked. Unlike `Disabled`,
    /// which queues samples for a later authorization, this state drops
    /// them until the next `enable()`; owners are expected to detach.
    Denied,
}

impl std::fmt::Display for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchState::Disabled => write!(f, "disabled"),
            DispatchState::PendingAuthorization => write!(f, "pending_authorization"),
            DispatchState::Enabled => write!(f, "enabled"),
            DispatchState::Denied => write!(f, "denied"),
        }
    }
}

struct Pipeline {
    state: DispatchState,
    next_sequence: u64,
    pending: VecDeque<Sample>,
    pending_ads: VecDeque<AdSample>,
    /// Bumped by every enable/disable; stale authorization results are ignored
    generation: u64,
    authorization: Option<JoinHandle<()>>,
}

struct Shared {
    pipeline: Mutex<Pipeline>,
    backend: Arc<dyn Backend>,
    license: Arc<dyn LicenseProvider>,
    handle: Handle,
    status: watch::Sender<DispatchState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pipeline> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, pipeline: &mut Pipeline, state: DispatchState) {
        pipeline.state = state;
        self.status.send_replace(state);
    }

    fn complete_authorization(&self, generation: u64, result: Result<AuthorizationResult>) {
        let mut pipeline = self.lock();
        if pipeline.generation != generation
            || pipeline.state != DispatchState::PendingAuthorization
        {
            debug!(generation, "Discarding superseded authorization result");
            return;
        }
        pipeline.authorization = None;

        let result = result.unwrap_or_else(|e| {
            warn!(error = %e, code = e.error_code(), "Authorization request failed");
            AuthorizationResult::Denied
        });

        match result {
            AuthorizationResult::Granted => {
                let samples = pipeline.pending.len();
                let ads = pipeline.pending_ads.len();
                for sample in pipeline.pending.drain(..) {
                    self.backend.send(sample);
                }
                for sample in pipeline.pending_ads.drain(..) {
                    self.backend.send_ad_sample(sample);
                }
                info!(samples, ads, "Authorized, queued samples released");
                self.set_state(&mut pipeline, DispatchState::Enabled);
            }
            AuthorizationResult::Denied => {
                let dropped = pipeline.pending.len() + pipeline.pending_ads.len();
                pipeline.pending.clear();
                pipeline.pending_ads.clear();
                warn!(dropped, "Authorization denied, samples discarded");
                self.set_state(&mut pipeline, DispatchState::Denied);
            }
        }
    }
}

/// Gates, numbers and forwards samples to a [`Backend`].
///
/// Cloning yields another handle to the same pipeline.
#[derive(Clone)]
pub struct SampleDispatcher {
    shared: Arc<Shared>,
}

impl SampleDispatcher {
    pub fn new(backend: Arc<dyn Backend>, license: Arc<dyn LicenseProvider>, handle: Handle) -> Self {
        let (status, _) = watch::channel(DispatchState::Disabled);
        Self {
            shared: Arc::new(Shared {
                pipeline: Mutex::new(Pipeline {
                    state: DispatchState::Disabled,
                    next_sequence: 0,
                    pending: VecDeque::new(),
                    pending_ads: VecDeque::new(),
                    generation: 0,
                    authorization: None,
                }),
                backend,
                license,
                handle,
                status,
            }),
        }
    }

    /// Start the authorization handshake; nothing is sent until it succeeds.
    /// Has no effect while a handshake is running or after it succeeded.
    pub fn enable(&self) {
        let mut pipeline = self.shared.lock();
        if matches!(
            pipeline.state,
            DispatchState::PendingAuthorization | DispatchState::Enabled
        ) {
            return;
        }

        pipeline.generation += 1;
        let generation = pipeline.generation;
        self.shared
            .set_state(&mut pipeline, DispatchState::PendingAuthorization);

        let shared = Arc::downgrade(&self.shared);
        let license = self.shared.license.clone();
        pipeline.authorization = Some(self.shared.handle.spawn(async move {
            let result = license.authorize().await;
            if let Some(shared) = shared.upgrade() {
                shared.complete_authorization(generation, result);
            }
        }));
        debug!(generation, "Authorization requested");
    }

    /// Drop queued samples and restart numbering at zero
    pub fn disable(&self) {
        let mut pipeline = self.shared.lock();
        pipeline.generation += 1;
        if let Some(task) = pipeline.authorization.take() {
            task.abort();
        }
        let dropped = pipeline.pending.len() + pipeline.pending_ads.len();
        pipeline.pending.clear();
        pipeline.pending_ads.clear();
        pipeline.next_sequence = 0;
        self.shared.set_state(&mut pipeline, DispatchState::Disabled);
        debug!(dropped, "Dispatcher disabled");
    }

    /// Number `sample` and forward or queue it
    pub fn add(&self, mut sample: Sample) {
        let mut pipeline = self.shared.lock();
        sample.sequence_number = pipeline.next_sequence;
        pipeline.next_sequence += 1;

        match pipeline.state {
            DispatchState::Enabled => self.shared.backend.send(sample),
            DispatchState::Disabled | DispatchState::PendingAuthorization => {
                pipeline.pending.push_back(sample)
            }
            DispatchState::Denied => {
                debug!(sequence = sample.sequence_number, "License denied, dropping sample")
            }
        }
    }

    /// Forward or queue an ad sample; ad samples are not numbered
    pub fn add_ad_sample(&self, sample: AdSample) {
        let mut pipeline = self.shared.lock();
        match pipeline.state {
            DispatchState::Enabled => self.shared.backend.send_ad_sample(sample),
            DispatchState::Disabled | DispatchState::PendingAuthorization => {
                pipeline.pending_ads.push_back(sample)
            }
            DispatchState::Denied => debug!("License denied, dropping ad sample"),
        }
    }

    pub fn state(&self) -> DispatchState {
        self.shared.lock().state
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DispatchState> {
        self.shared.status.subscribe()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn pending_ad_len(&self) -> usize {
        self.shared.lock().pending_ads.len()
    }

    /// Sequence number the next sample will receive
    pub fn next_sequence_number(&self) -> u64 {
        self.shared.lock().next_sequence
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.shared.backend
    }
}

impl std::fmt::Debug for SampleDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pipeline = self.shared.lock();
        f.debug_struct("SampleDispatcher")
            .field("state", &pipeline.state)
            .field("next_sequence", &pipeline.next_sequence)
            .field("pending", &pipeline.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::StaticLicenseProvider;
    use crate::testing::{sample_with_sequence, RecordingBackend, ScriptedLicenseProvider};
    use crate::types::ImpressionId;
    use crate::config::CollectorConfig;

    fn dispatcher(license: Arc<dyn LicenseProvider>) -> (SampleDispatcher, Arc<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend::default());
        let dispatcher = SampleDispatcher::new(backend.clone(), license, Handle::current());
        (dispatcher, backend)
    }

    async fn wait_for(rx: &mut watch::Receiver<DispatchState>, state: DispatchState) {
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test]
    async fn test_starts_disabled_and_queues() {
        let (dispatcher, backend) = dispatcher(Arc::new(StaticLicenseProvider::granted()));
        dispatcher.add(sample_with_sequence(99));
        dispatcher.add(sample_with_sequence(99));

        assert_eq!(dispatcher.state(), DispatchState::Disabled);
        assert_eq!(dispatcher.pending_len(), 2);
        assert!(backend.samples().is_empty());
    }

    #[tokio::test]
    async fn test_authorization_drains_in_order() {
        let license = Arc::new(ScriptedLicenseProvider::pending());
        let (dispatcher, backend) = dispatcher(license.clone());
        let mut status = dispatcher.subscribe_status();

        dispatcher.enable();
        for _ in 0..5 {
            dispatcher.add(sample_with_sequence(99));
        }
        assert_eq!(dispatcher.state(), DispatchState::PendingAuthorization);
        assert!(backend.samples().is_empty());

        license.resolve(AuthorizationResult::Granted);
        wait_for(&mut status, DispatchState::Enabled).await;

        dispatcher.add(sample_with_sequence(99));
        assert_eq!(backend.sequence_numbers(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_ad_samples_released_after_samples() {
        let (dispatcher, backend) = dispatcher(Arc::new(StaticLicenseProvider::granted()));
        let config = CollectorConfig::default();
        dispatcher.add_ad_sample(AdSample::new(&config, ImpressionId::new()));
        dispatcher.add(sample_with_sequence(0));
        assert_eq!(dispatcher.pending_ad_len(), 1);

        let mut status = dispatcher.subscribe_status();
        dispatcher.enable();
        wait_for(&mut status, DispatchState::Enabled).await;

        assert_eq!(backend.samples().len(), 1);
        assert_eq!(backend.ad_samples().len(), 1);
        assert_eq!(dispatcher.pending_ad_len(), 0);
    }

    #[tokio::test]
    async fn test_disable_resets_sequence() {
        let (dispatcher, backend) = dispatcher(Arc::new(StaticLicenseProvider::granted()));
        let mut status = dispatcher.subscribe_status();
        dispatcher.enable();
        wait_for(&mut status, DispatchState::Enabled).await;
        dispatcher.add(sample_with_sequence(99));
        dispatcher.add(sample_with_sequence(99));

        dispatcher.disable();
        assert_eq!(dispatcher.next_sequence_number(), 0);
        dispatcher.enable();
        wait_for(&mut status, DispatchState::Enabled).await;
        dispatcher.add(sample_with_sequence(99));

        assert_eq!(backend.sequence_numbers(), vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn test_denied_discards_queue() {
        let (dispatcher, backend) = dispatcher(Arc::new(StaticLicenseProvider::denied()));
        let mut status = dispatcher.subscribe_status();
        dispatcher.add(sample_with_sequence(0));
        dispatcher.enable();
        wait_for(&mut status, DispatchState::Denied).await;

        dispatcher.add(sample_with_sequence(1));
        assert_eq!(dispatcher.pending_len(), 0);
        assert!(backend.samples().is_empty());
    }

    #[tokio::test]
    async fn test_disable_after_denial_queues_again() {
        let (dispatcher, _) = dispatcher(Arc::new(StaticLicenseProvider::denied()));
        let mut status = dispatcher.subscribe_status();
        dispatcher.enable();
        wait_for(&mut status, DispatchState::Denied).await;
        dispatcher.add(sample_with_sequence(0));
        assert_eq!(dispatcher.pending_len(), 0);

        dispatcher.disable();
        dispatcher.add(sample_with_sequence(0));
        assert_eq!(dispatcher.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_stale_authorization_ignored() {
        let license = Arc::new(ScriptedLicenseProvider::pending());
        let (dispatcher, backend) = dispatcher(license.clone());

        dispatcher.enable();
        dispatcher.add(sample_with_sequence(0));
        dispatcher.disable();
        license.resolve(AuthorizationResult::Granted);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(dispatcher.state(), DispatchState::Disabled);
        assert!(backend.samples().is_empty());
    }

    #[tokio::test]
    async fn test_enable_is_idempotent_while_pending() {
        let license = Arc::new(ScriptedLicenseProvider::pending());
        let (dispatcher, _) = dispatcher(license.clone());
        dispatcher.enable();
        dispatcher.enable();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(license.calls(), 1);
    }
}
