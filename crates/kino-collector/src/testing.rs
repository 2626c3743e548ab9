//! Hand-written test doubles for collector consumers.
//!
//! Recording implementations of the listener, transport, backend and license
//! seams, usable from unit tests, integration tests and benchmarks.

use crate::{
    backend::{Backend, Payload, SampleTransport},
    config::CollectorConfig,
    license::{AuthorizationResult, LicenseProvider},
    sample::{AdSample, Sample},
    state::{StateMachineListener, StateSnapshot},
    types::*,
    Error, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A sample numbered `sequence`, as the dispatcher would have left it
pub fn sample_with_sequence(sequence: u64) -> Sample {
    let snapshot = StateSnapshot {
        impression_id: ImpressionId::new(),
        state: PlayerState::Playing,
        next_state: Some(PlayerState::Pause),
        duration_ms: 1_000,
        video_time_start_ms: 0,
        video_time_end_ms: 1_000,
        custom_data: CustomData::default(),
        startup_finished: true,
        video_start_failed_reason: None,
        session_start: Utc::now(),
        first_ready: None,
    };
    let mut sample = Sample::from_snapshot(&snapshot, &CollectorConfig::new("test-key"));
    sample.sequence_number = sequence;
    sample
}

/// One listener callback as observed by [`RecordingListener`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    Startup {
        snapshot: StateSnapshot,
        video_startup_ms: u64,
        player_startup_ms: u64,
    },
    PauseExit { snapshot: StateSnapshot, duration_ms: u64 },
    PlayExit { snapshot: StateSnapshot, duration_ms: u64 },
    Rebuffering { snapshot: StateSnapshot, duration_ms: u64 },
    Error { snapshot: StateSnapshot, code: ErrorCode },
    SeekComplete { snapshot: StateSnapshot, duration_ms: u64 },
    Heartbeat { snapshot: StateSnapshot, duration_ms: u64 },
    QualityChange { snapshot: StateSnapshot },
    SubtitleChange { snapshot: StateSnapshot },
    AudioTrackChange { snapshot: StateSnapshot },
    VideoStartFailed {
        snapshot: StateSnapshot,
        reason: VideoStartFailedReason,
    },
}

/// Listener that records every callback in order
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingListener {
    fn record(&self, event: RecordedEvent) {
        lock(&self.events).push(event);
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    /// `(video_startup_ms, player_startup_ms)` of every startup
    pub fn startups(&self) -> Vec<(u64, u64)> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                RecordedEvent::Startup {
                    video_startup_ms,
                    player_startup_ms,
                    ..
                } => Some((*video_startup_ms, *player_startup_ms)),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<ErrorCode> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                RecordedEvent::Error { code, .. } => Some(code.clone()),
                _ => None,
            })
            .collect()
    }

    /// `(state, duration_ms)` of every heartbeat
    pub fn heartbeats(&self) -> Vec<(PlayerState, u64)> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                RecordedEvent::Heartbeat {
                    snapshot,
                    duration_ms,
                } => Some((snapshot.state, *duration_ms)),
                _ => None,
            })
            .collect()
    }
}

impl StateMachineListener for RecordingListener {
    fn on_startup(&self, snapshot: &StateSnapshot, video_startup_ms: u64, player_startup_ms: u64) {
        self.record(RecordedEvent::Startup {
            snapshot: snapshot.clone(),
            video_startup_ms,
            player_startup_ms,
        });
    }

    fn on_pause_exit(&self, snapshot: &StateSnapshot, duration_ms: u64) {
        self.record(RecordedEvent::PauseExit {
            snapshot: snapshot.clone(),
            duration_ms,
        });
    }

    fn on_play_exit(&self, snapshot: &StateSnapshot, duration_ms: u64) {
        self.record(RecordedEvent::PlayExit {
            snapshot: snapshot.clone(),
            duration_ms,
        });
    }

    fn on_rebuffering(&self, snapshot: &StateSnapshot, duration_ms: u64) {
        self.record(RecordedEvent::Rebuffering {
            snapshot: snapshot.clone(),
            duration_ms,
        });
    }

    fn on_error(&self, snapshot: &StateSnapshot, error: &ErrorCode) {
        self.record(RecordedEvent::Error {
            snapshot: snapshot.clone(),
            code: error.clone(),
        });
    }

    fn on_seek_complete(&self, snapshot: &StateSnapshot, duration_ms: u64) {
        self.record(RecordedEvent::SeekComplete {
            snapshot: snapshot.clone(),
            duration_ms,
        });
    }

    fn on_heartbeat(&self, snapshot: &StateSnapshot, duration_ms: u64) {
        self.record(RecordedEvent::Heartbeat {
            snapshot: snapshot.clone(),
            duration_ms,
        });
    }

    fn on_quality_change(&self, snapshot: &StateSnapshot) {
        self.record(RecordedEvent::QualityChange {
            snapshot: snapshot.clone(),
        });
    }

    fn on_subtitle_change(&self, snapshot: &StateSnapshot) {
        self.record(RecordedEvent::SubtitleChange {
            snapshot: snapshot.clone(),
        });
    }

    fn on_audio_track_change(&self, snapshot: &StateSnapshot) {
        self.record(RecordedEvent::AudioTrackChange {
            snapshot: snapshot.clone(),
        });
    }

    fn on_video_start_failed(&self, snapshot: &StateSnapshot, reason: VideoStartFailedReason) {
        self.record(RecordedEvent::VideoStartFailed {
            snapshot: snapshot.clone(),
            reason,
        });
    }
}

/// Transport that records deliveries and can be told to fail
#[derive(Debug, Default)]
pub struct RecordingTransport {
    delivered: Mutex<Vec<Payload>>,
    attempts: AtomicUsize,
    /// Number of leading attempts that fail; `usize::MAX` fails forever
    failures: usize,
    failure_status: u16,
}

impl RecordingTransport {
    /// Every delivery fails with HTTP `status`
    pub fn failing_with(status: u16) -> Self {
        Self::failing_times(usize::MAX, status)
    }

    /// The first `times` deliveries fail with HTTP `status`
    pub fn failing_times(times: usize, status: u16) -> Self {
        Self {
            failures: times,
            failure_status: status,
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<Payload> {
        lock(&self.delivered).clone()
    }

    /// Sequence numbers of successfully delivered samples
    pub fn sequence_numbers(&self) -> Vec<u64> {
        lock(&self.delivered)
            .iter()
            .filter_map(|p| match p {
                Payload::Sample(sample) => Some(sample.sequence_number),
                Payload::Ad(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl SampleTransport for RecordingTransport {
    async fn deliver(&self, payload: &Payload) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(Error::HttpStatus {
                status: self.failure_status,
                url: "http://collector.test/analytics".into(),
            });
        }
        lock(&self.delivered).push(payload.clone());
        Ok(())
    }
}

/// Backend that records what it is asked to send
#[derive(Debug, Default)]
pub struct RecordingBackend {
    samples: Mutex<Vec<Sample>>,
    ad_samples: Mutex<Vec<AdSample>>,
}

impl RecordingBackend {
    pub fn samples(&self) -> Vec<Sample> {
        lock(&self.samples).clone()
    }

    pub fn ad_samples(&self) -> Vec<AdSample> {
        lock(&self.ad_samples).clone()
    }

    pub fn sequence_numbers(&self) -> Vec<u64> {
        lock(&self.samples).iter().map(|s| s.sequence_number).collect()
    }

    /// Wire state names of the recorded samples, in order
    pub fn states(&self) -> Vec<String> {
        lock(&self.samples).iter().map(|s| s.state.clone()).collect()
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    fn send(&self, sample: Sample) {
        lock(&self.samples).push(sample);
    }

    fn send_ad_sample(&self, sample: AdSample) {
        lock(&self.ad_samples).push(sample);
    }
}

/// License provider whose answer is released by the test
#[derive(Debug)]
pub struct ScriptedLicenseProvider {
    answer: watch::Sender<Option<AuthorizationResult>>,
    calls: AtomicUsize,
}

impl ScriptedLicenseProvider {
    /// Authorization blocks until [`resolve`](Self::resolve) is called
    pub fn pending() -> Self {
        let (answer, _) = watch::channel(None);
        Self {
            answer,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn resolve(&self, result: AuthorizationResult) {
        self.answer.send_replace(Some(result));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LicenseProvider for ScriptedLicenseProvider {
    async fn authorize(&self) -> Result<AuthorizationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.answer.subscribe();
        let answer = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Internal("license script dropped".into()))?;
        Ok((*answer).unwrap_or(AuthorizationResult::Denied))
    }
}
