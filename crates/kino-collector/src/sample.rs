//! Telemetry samples
//!
//! A [`Sample`] describes one finished time slice of an impression. It is
//! built from a [`StateSnapshot`], decorated by the manipulator pipeline and
//! numbered by the dispatcher; after that it is never mutated again.

use crate::{
    config::CollectorConfig,
    state::StateSnapshot,
    types::*,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Collector version reported in every sample
pub const ANALYTICS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One playback telemetry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub key: String,
    pub impression_id: ImpressionId,
    /// Assigned by the dispatcher; strictly increasing within an enabled session
    pub sequence_number: u64,
    pub analytics_version: String,
    /// Wall-clock time the sample was created
    pub time: DateTime<Utc>,
    pub session_start: DateTime<Utc>,

    /// Wire name of the state the slice was spent in
    pub state: String,
    pub duration: u64,
    pub played: u64,
    pub paused: u64,
    pub buffered: u64,
    pub seeked: u64,
    pub video_time_start: u64,
    pub video_time_end: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_startup_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_startup_time: Option<u64>,
    pub video_start_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_start_failed_reason: Option<VideoStartFailedReason>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_details: Vec<String>,

    #[serde(flatten)]
    pub custom_data: CustomData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cdn_provider: Option<String>,

    // Filled in by manipulators
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_bitrate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_bitrate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_playback_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_playback_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_live: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drm_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_format: Option<StreamFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_tech: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Sample {
    /// Build the sample for a finished slice.
    ///
    /// The slice duration is booked into the one bucket matching its state;
    /// every other bucket stays zero.
    pub fn from_snapshot(snapshot: &StateSnapshot, config: &CollectorConfig) -> Self {
        let duration = snapshot.duration_ms;
        let bucket = |state: PlayerState| if snapshot.state == state { duration } else { 0 };

        Self {
            key: config.license_key.clone(),
            impression_id: snapshot.impression_id,
            sequence_number: 0,
            analytics_version: ANALYTICS_VERSION.to_string(),
            time: Utc::now(),
            session_start: snapshot.session_start,
            state: snapshot.state.name().to_string(),
            duration,
            played: bucket(PlayerState::Playing),
            paused: bucket(PlayerState::Pause),
            buffered: bucket(PlayerState::Buffering),
            seeked: bucket(PlayerState::Seeking),
            video_time_start: snapshot.video_time_start_ms,
            video_time_end: snapshot.video_time_end_ms,
            video_startup_time: None,
            player_startup_time: None,
            video_start_failed: false,
            video_start_failed_reason: None,
            error_code: None,
            error_message: None,
            error_details: Vec::new(),
            custom_data: snapshot.custom_data.clone(),
            title: config.title.clone(),
            video_id: config.video_id.clone(),
            cdn_provider: config.cdn_provider.clone(),
            video_bitrate: None,
            audio_bitrate: None,
            video_playback_width: None,
            video_playback_height: None,
            video_duration: None,
            is_live: None,
            is_muted: None,
            drm_type: None,
            stream_format: None,
            player: None,
            player_tech: None,
            player_version: None,
            platform: None,
            device_model: None,
            os: None,
            language: None,
            user_agent: None,
        }
    }

    pub fn with_startup(mut self, video_startup_ms: u64, player_startup_ms: u64) -> Self {
        self.video_startup_time = Some(video_startup_ms);
        self.player_startup_time = Some(player_startup_ms);
        self
    }

    pub fn with_error(mut self, error: &ErrorCode) -> Self {
        self.error_code = Some(error.code);
        self.error_message = Some(error.message.clone());
        self.error_details = error.details.clone();
        self
    }

    /// Mark the sample as a failed start; a reason with a synthetic error
    /// code fills the error fields unless a player error is already set
    pub fn with_video_start_failed(mut self, reason: VideoStartFailedReason) -> Self {
        self.video_start_failed = true;
        self.video_start_failed_reason = Some(reason);
        match reason.error_code() {
            Some(error) if self.error_code.is_none() => self.with_error(&error),
            _ => self,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }
}

/// Minimal ad telemetry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdSample {
    pub key: String,
    pub ad_impression_id: Uuid,
    /// Impression of the content the ad played in
    pub video_impression_id: ImpressionId,
    pub analytics_version: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ad_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ad_system: Option<String>,
    /// Placement such as `pre`, `mid` or `post`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ad_position: Option<String>,
    pub time_in_ad: u64,
    pub started: bool,
    pub completed: bool,
    pub skipped: bool,
    pub clicked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AdSample {
    pub fn new(config: &CollectorConfig, video_impression_id: ImpressionId) -> Self {
        Self {
            key: config.license_key.clone(),
            ad_impression_id: Uuid::new_v4(),
            video_impression_id,
            analytics_version: ANALYTICS_VERSION.to_string(),
            time: Utc::now(),
            ad_id: None,
            ad_system: None,
            ad_position: None,
            time_in_ad: 0,
            started: false,
            completed: false,
            skipped: false,
            clicked: false,
            error_code: None,
            error_message: None,
        }
    }

    pub fn with_error(mut self, error: &ErrorCode) -> Self {
        self.error_code = Some(error.code);
        self.error_message = Some(error.message.clone());
        self
    }
}
