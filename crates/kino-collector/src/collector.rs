//! Analytics collector facade
//!
//! Owns one state machine, the manipulator pipeline and the dispatcher, and
//! turns every state machine event into a decorated sample.

use crate::{
    backend::{create_backend, Backend},
    config::CollectorConfig,
    dispatch::{DispatchState, SampleDispatcher},
    license::{HttpLicenseProvider, LicenseProvider},
    manipulator::{
        DeviceInfo, DeviceInfoManipulator, ManipulatorPipeline, PlaybackInfoManipulator,
        PlaybackInfoSource, SampleManipulator,
    },
    sample::{AdSample, Sample},
    state::{PositionSource, StateMachine, StateMachineListener, StateSnapshot},
    timer::TimerService,
    types::*,
    Result,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Domain reported to the licensing service
const DEFAULT_DOMAIN: &str = "kino-collector";

struct CollectorInner {
    machine: StateMachine,
    dispatcher: SampleDispatcher,
    manipulators: RwLock<ManipulatorPipeline>,
    device: DeviceInfo,
    handle: Handle,
    attached: AtomicBool,
    denial_watch: Mutex<Option<JoinHandle<()>>>,
}

impl CollectorInner {
    fn config(&self) -> &CollectorConfig {
        self.machine.config()
    }

    fn dispatch(&self, mut sample: Sample) {
        self.manipulators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .decorate(&mut sample);
        debug!(
            state = %sample.state,
            duration_ms = sample.duration,
            impression_id = %sample.impression_id,
            "Sample created"
        );
        self.dispatcher.add(sample);
    }

    fn sample(&self, snapshot: &StateSnapshot) -> Sample {
        let sample = Sample::from_snapshot(snapshot, self.config());
        match snapshot.video_start_failed_reason {
            Some(reason) if !snapshot.startup_finished => sample.with_video_start_failed(reason),
            _ => sample,
        }
    }

    fn attach(self: &Arc<Self>) {
        self.detach_inner(false);
        self.attached.store(true, Ordering::SeqCst);

        {
            let mut pipeline = self.manipulators.write().unwrap_or_else(PoisonError::into_inner);
            pipeline.register(Arc::new(DeviceInfoManipulator::new(self.device.clone())));
        }

        let mut status = self.dispatcher.subscribe_status();
        let weak = Arc::downgrade(self);
        let watch = self.handle.spawn(async move {
            if status.wait_for(|s| *s == DispatchState::Denied).await.is_ok() {
                if let Some(inner) = weak.upgrade() {
                    warn!("License denied, detaching collector");
                    inner.detach_inner(false);
                }
            }
        });
        let previous = self
            .denial_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(watch);
        if let Some(previous) = previous {
            previous.abort();
        }

        self.dispatcher.enable();
        info!(impression_id = %self.machine.impression_id(), "Collector attached");
    }

    /// Tear the session down. With `close_startup` an unfinished startup is
    /// reported as a failed video start before the dispatcher is disabled.
    fn detach_inner(&self, close_startup: bool) {
        let was_attached = self.attached.swap(false, Ordering::SeqCst);

        if close_startup
            && was_attached
            && !self.machine.is_startup_finished()
            && self.machine.current_state() == PlayerState::Startup
        {
            let position = self.machine.current_position();
            self.machine
                .exit_before_video_start(position, VideoStartFailedReason::PageClosed);
        }

        if let Some(watch) = self
            .denial_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watch.abort();
        }
        self.dispatcher.disable();
        self.manipulators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.machine.reset();

        if was_attached {
            info!("Collector detached");
        }
    }

    /// Detach from a listener callback without re-entering the state machine
    fn detach_later(self: &Arc<Self>, impression_id: ImpressionId) {
        let weak = Arc::downgrade(self);
        self.handle.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                // A newer session started in the meantime
                if inner.machine.impression_id() == impression_id {
                    inner.detach_inner(false);
                }
            }
        });
    }
}

/// Forwards state machine events to the owning collector
struct SampleSink {
    inner: Weak<CollectorInner>,
}

impl SampleSink {
    fn with_inner(&self, f: impl FnOnce(&Arc<CollectorInner>)) {
        if let Some(inner) = self.inner.upgrade() {
            f(&inner);
        }
    }
}

impl StateMachineListener for SampleSink {
    fn on_startup(&self, snapshot: &StateSnapshot, video_startup_ms: u64, player_startup_ms: u64) {
        self.with_inner(|inner| {
            let sample = inner
                .sample(snapshot)
                .with_startup(video_startup_ms, player_startup_ms);
            inner.dispatch(sample);
        });
    }

    fn on_pause_exit(&self, snapshot: &StateSnapshot, _duration_ms: u64) {
        self.with_inner(|inner| inner.dispatch(inner.sample(snapshot)));
    }

    fn on_play_exit(&self, snapshot: &StateSnapshot, _duration_ms: u64) {
        self.with_inner(|inner| inner.dispatch(inner.sample(snapshot)));
    }

    fn on_rebuffering(&self, snapshot: &StateSnapshot, _duration_ms: u64) {
        self.with_inner(|inner| inner.dispatch(inner.sample(snapshot)));
    }

    fn on_error(&self, snapshot: &StateSnapshot, error: &ErrorCode) {
        self.with_inner(|inner| inner.dispatch(inner.sample(snapshot).with_error(error)));
    }

    fn on_seek_complete(&self, snapshot: &StateSnapshot, _duration_ms: u64) {
        self.with_inner(|inner| inner.dispatch(inner.sample(snapshot)));
    }

    fn on_heartbeat(&self, snapshot: &StateSnapshot, _duration_ms: u64) {
        self.with_inner(|inner| inner.dispatch(inner.sample(snapshot)));
    }

    fn on_quality_change(&self, snapshot: &StateSnapshot) {
        self.with_inner(|inner| inner.dispatch(inner.sample(snapshot)));
    }

    fn on_subtitle_change(&self, snapshot: &StateSnapshot) {
        self.with_inner(|inner| inner.dispatch(inner.sample(snapshot)));
    }

    fn on_audio_track_change(&self, snapshot: &StateSnapshot) {
        self.with_inner(|inner| inner.dispatch(inner.sample(snapshot)));
    }

    fn on_video_start_failed(&self, snapshot: &StateSnapshot, reason: VideoStartFailedReason) {
        self.with_inner(|inner| {
            warn!(%reason, impression_id = %snapshot.impression_id, "Video start failed");
            inner.dispatch(inner.sample(snapshot).with_video_start_failed(reason));
            inner.detach_later(snapshot.impression_id);
        });
    }
}

/// Collects playback analytics for one player
#[derive(Clone)]
pub struct Collector {
    inner: Arc<CollectorInner>,
}

impl Collector {
    /// Collector posting to the configured backend, on the current runtime
    pub fn new(config: CollectorConfig) -> Result<Self> {
        config.validate()?;
        let handle = TimerService::current()?.handle().clone();
        let backend = create_backend(&config, &handle)?;
        let license = Arc::new(HttpLicenseProvider::new(&config, DEFAULT_DOMAIN)?);
        Ok(Self::with_parts(config, backend, license, handle))
    }

    /// Collector over explicit collaborators
    pub fn with_parts(
        config: CollectorConfig,
        backend: Arc<dyn Backend>,
        license: Arc<dyn LicenseProvider>,
        handle: Handle,
    ) -> Self {
        let machine = StateMachine::new(config, TimerService::new(handle.clone()));
        let dispatcher = SampleDispatcher::new(backend, license, handle.clone());
        let inner = Arc::new(CollectorInner {
            machine,
            dispatcher,
            manipulators: RwLock::new(ManipulatorPipeline::new()),
            device: DeviceInfo::host(),
            handle,
            attached: AtomicBool::new(false),
            denial_watch: Mutex::new(None),
        });
        inner.machine.add_listener(Arc::new(SampleSink {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    /// Start a fresh session and begin authorization
    #[instrument(skip(self))]
    pub fn attach(&self) {
        self.inner.attach();
    }

    /// Stop collecting. An unfinished startup is reported as a failed start
    #[instrument(skip(self))]
    pub fn detach(&self) {
        self.inner.detach_inner(true);
    }

    pub fn is_attached(&self) -> bool {
        self.inner.attached.load(Ordering::SeqCst)
    }

    /// State machine driven by the player adapter
    pub fn machine(&self) -> &StateMachine {
        &self.inner.machine
    }

    pub fn dispatcher(&self) -> &SampleDispatcher {
        &self.inner.dispatcher
    }

    pub fn config(&self) -> &CollectorConfig {
        self.inner.config()
    }

    pub fn impression_id(&self) -> ImpressionId {
        self.inner.machine.impression_id()
    }

    /// Register a manipulator for the current session; cleared on detach
    pub fn register_manipulator(&self, manipulator: Arc<dyn SampleManipulator>) {
        self.inner
            .manipulators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(manipulator);
    }

    /// Decorate samples with the adapter's live playback details
    pub fn set_playback_info_source(&self, source: Arc<dyn PlaybackInfoSource>) {
        self.register_manipulator(Arc::new(PlaybackInfoManipulator::new(source)));
    }

    pub fn set_position_source(&self, source: Arc<dyn PositionSource>) {
        self.inner.machine.set_position_source(Some(source));
    }

    /// New ad sample bound to the current impression
    pub fn new_ad_sample(&self) -> AdSample {
        AdSample::new(self.config(), self.impression_id())
    }

    pub fn send_ad_sample(&self, sample: AdSample) {
        self.inner.dispatcher.add_ad_sample(sample);
    }

    pub fn change_custom_data(&self, position_ms: u64, data: CustomData) {
        self.inner.machine.change_custom_data(position_ms, data);
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("attached", &self.is_attached())
            .field("machine", &self.inner.machine)
            .field("dispatcher", &self.inner.dispatcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::StaticLicenseProvider;
    use crate::testing::{RecordingBackend, ScriptedLicenseProvider};
    use crate::license::AuthorizationResult;
    use std::time::Duration;

    fn collector(license: Arc<dyn LicenseProvider>) -> (Collector, Arc<RecordingBackend>) {
        let backend = Arc::new(RecordingBackend::default());
        let collector = Collector::with_parts(
            CollectorConfig::new("test-key"),
            backend.clone(),
            license,
            Handle::current(),
        );
        (collector, backend)
    }

    async fn enabled(collector: &Collector) {
        let mut status = collector.dispatcher().subscribe_status();
        status.wait_for(|s| *s == DispatchState::Enabled).await.unwrap();
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_samples_flow_to_backend() {
        let (collector, backend) = collector(Arc::new(StaticLicenseProvider::granted()));
        collector.attach();
        enabled(&collector).await;

        let machine = collector.machine();
        machine.transition(PlayerState::Startup, 0);
        machine.transition(PlayerState::Playing, 0);
        machine.pause(5_000);

        assert_eq!(backend.states(), vec!["startup", "playing"]);
        assert_eq!(backend.sequence_numbers(), vec![0, 1]);
        let samples = backend.samples();
        assert!(samples[0].video_startup_time.is_some());
        assert_eq!(samples[1].video_time_end, 5_000);
        assert!(samples.iter().all(|s| s.os.is_some()));
    }

    #[tokio::test]
    async fn test_samples_wait_for_authorization() {
        let license = Arc::new(ScriptedLicenseProvider::pending());
        let (collector, backend) = collector(license.clone());
        collector.attach();

        collector.machine().transition(PlayerState::Startup, 0);
        collector.machine().transition(PlayerState::Playing, 0);
        assert!(backend.samples().is_empty());
        assert_eq!(collector.dispatcher().pending_len(), 1);

        license.resolve(AuthorizationResult::Granted);
        enabled(&collector).await;
        assert_eq!(backend.states(), vec!["startup"]);
    }

    #[tokio::test]
    async fn test_denial_detaches() {
        let (collector, backend) = collector(Arc::new(StaticLicenseProvider::denied()));
        collector.attach();
        collector.machine().transition(PlayerState::Startup, 0);
        settle().await;

        assert!(!collector.is_attached());
        assert_eq!(collector.machine().current_state(), PlayerState::Setup);
        assert_eq!(collector.dispatcher().state(), DispatchState::Disabled);
        assert!(backend.samples().is_empty());
    }

    #[tokio::test]
    async fn test_video_start_failure_sends_sample_then_detaches() {
        let (collector, backend) = collector(Arc::new(StaticLicenseProvider::granted()));
        collector.attach();
        enabled(&collector).await;
        let impression = collector.impression_id();

        collector.machine().transition(PlayerState::Startup, 0);
        collector
            .machine()
            .exit_before_video_start(0, VideoStartFailedReason::PlayerError);
        settle().await;

        let samples = backend.samples();
        let failed = samples.last().unwrap();
        assert!(failed.video_start_failed);
        assert_eq!(failed.video_start_failed_reason, Some(VideoStartFailedReason::PlayerError));
        assert_eq!(failed.impression_id, impression);
        assert!(!collector.is_attached());
        assert_ne!(collector.impression_id(), impression);
    }

    #[tokio::test]
    async fn test_detach_during_startup_reports_page_closed() {
        let (collector, backend) = collector(Arc::new(StaticLicenseProvider::granted()));
        collector.attach();
        enabled(&collector).await;

        collector.machine().transition(PlayerState::Startup, 0);
        collector.detach();

        let samples = backend.samples();
        assert_eq!(
            samples.last().and_then(|s| s.video_start_failed_reason),
            Some(VideoStartFailedReason::PageClosed)
        );
        assert_eq!(collector.dispatcher().state(), DispatchState::Disabled);
    }

    #[tokio::test]
    async fn test_detach_during_startup_keeps_position() {
        let (collector, backend) = collector(Arc::new(StaticLicenseProvider::granted()));
        collector.attach();
        enabled(&collector).await;

        collector.machine().transition(PlayerState::Startup, 1_500);
        collector.detach();
        assert_eq!(backend.samples().last().map(|s| s.video_time_end), Some(1_500));

        collector.set_position_source(Arc::new(|| 4_200u64));
        collector.attach();
        enabled(&collector).await;
        collector.machine().transition(PlayerState::Startup, 0);
        collector.detach();
        assert_eq!(backend.samples().last().map(|s| s.video_time_end), Some(4_200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_timeout_sample_carries_error_code() {
        let (collector, backend) = collector(Arc::new(StaticLicenseProvider::granted()));
        collector.attach();
        enabled(&collector).await;

        collector.machine().transition(PlayerState::Startup, 0);
        tokio::time::advance(Duration::from_secs(65)).await;
        settle().await;

        let failed = backend
            .samples()
            .into_iter()
            .find(|s| s.video_start_failed)
            .unwrap();
        assert_eq!(failed.video_start_failed_reason, Some(VideoStartFailedReason::Timeout));
        assert_eq!(failed.error_code, Some(ErrorCode::VIDEO_START_TIMEOUT_REACHED));
        assert_eq!(
            failed.error_message.as_deref(),
            Some("ANALYTICS_VIDEOSTART_TIMEOUT_REACHED")
        );
        assert!(!collector.is_attached());
    }

    #[tokio::test]
    async fn test_detach_clears_manipulators() {
        let (collector, backend) = collector(Arc::new(StaticLicenseProvider::granted()));
        collector.attach();
        enabled(&collector).await;
        collector.register_manipulator(Arc::new(|s: &mut Sample| s.player = Some("test".into())));

        collector.detach();
        collector.attach();
        enabled(&collector).await;
        collector.machine().transition(PlayerState::Playing, 0);
        collector.machine().pause(0);

        let samples = backend.samples();
        assert_eq!(samples.last().unwrap().player, None);
    }

    #[tokio::test]
    async fn test_error_before_startup_marks_failed_start() {
        let (collector, backend) = collector(Arc::new(StaticLicenseProvider::granted()));
        collector.attach();
        enabled(&collector).await;

        collector.machine().transition(PlayerState::Startup, 0);
        collector.machine().error(0, ErrorCode::new(1200, "network"));

        let error = backend.samples().into_iter().find(|s| s.is_error()).unwrap();
        assert_eq!(error.error_code, Some(1200));
        assert!(error.video_start_failed);
    }
}
