//! Listener capability notified by the state machine

use crate::types::{CustomData, ErrorCode, ImpressionId, PlayerState, VideoStartFailedReason};
use chrono::{DateTime, Utc};

/// Finished time slice handed to listeners.
///
/// One snapshot is built per emission and shared by every listener, so all
/// of them observe the same values for a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub impression_id: ImpressionId,
    /// State the slice was spent in
    pub state: PlayerState,
    /// State the machine is moving to, if the emission comes from a transition
    pub next_state: Option<PlayerState>,
    pub duration_ms: u64,
    pub video_time_start_ms: u64,
    pub video_time_end_ms: u64,
    pub custom_data: CustomData,
    pub startup_finished: bool,
    pub video_start_failed_reason: Option<VideoStartFailedReason>,
    pub session_start: DateTime<Utc>,
    pub first_ready: Option<DateTime<Utc>>,
}

/// Semantic events emitted by the state machine.
///
/// Callbacks run synchronously inside the machine's critical section, in
/// registration order. They must not call back into the machine; defer such
/// work onto the runtime instead.
#[allow(unused_variables)]
pub trait StateMachineListener: Send + Sync {
    /// Startup finished and playback began
    fn on_startup(&self, snapshot: &StateSnapshot, video_startup_time_ms: u64, player_startup_time_ms: u64) {}

    fn on_pause_exit(&self, snapshot: &StateSnapshot, duration_ms: u64) {}

    fn on_play_exit(&self, snapshot: &StateSnapshot, duration_ms: u64) {}

    fn on_rebuffering(&self, snapshot: &StateSnapshot, duration_ms: u64) {}

    fn on_error(&self, snapshot: &StateSnapshot, error: &ErrorCode) {}

    fn on_seek_complete(&self, snapshot: &StateSnapshot, duration_ms: u64) {}

    /// Periodic emission while playing or rebuffering
    fn on_heartbeat(&self, snapshot: &StateSnapshot, duration_ms: u64) {}

    fn on_quality_change(&self, snapshot: &StateSnapshot) {}

    fn on_subtitle_change(&self, snapshot: &StateSnapshot) {}

    fn on_audio_track_change(&self, snapshot: &StateSnapshot) {}

    fn on_video_start_failed(&self, snapshot: &StateSnapshot, reason: VideoStartFailedReason) {}
}

/// Current playback position supplied by a player adapter
pub trait PositionSource: Send + Sync {
    fn position_ms(&self) -> u64;
}

impl<F> PositionSource for F
where
    F: Fn() -> u64 + Send + Sync,
{
    fn position_ms(&self) -> u64 {
        self()
    }
}
