//! Core types for the Kino collector

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one playback impression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImpressionId(pub Uuid);

impl ImpressionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ImpressionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ImpressionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Playback states tracked by the analytics state machine.
///
/// Every state can transition to every other state. Enter/exit side effects
/// live in a fixed behavior table, see [`crate::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Setup,
    Startup,
    Ready,
    SourceChanged,
    Ad,
    AdFinished,
    Buffering,
    Error,
    ExitBeforeVideoStart,
    Playing,
    Pause,
    QualityChange,
    CustomDataChange,
    AudioTrackChange,
    SubtitleChange,
    Seeking,
}

impl PlayerState {
    /// All states, in declaration order
    pub const ALL: [PlayerState; 16] = [
        PlayerState::Setup,
        PlayerState::Startup,
        PlayerState::Ready,
        PlayerState::SourceChanged,
        PlayerState::Ad,
        PlayerState::AdFinished,
        PlayerState::Buffering,
        PlayerState::Error,
        PlayerState::ExitBeforeVideoStart,
        PlayerState::Playing,
        PlayerState::Pause,
        PlayerState::QualityChange,
        PlayerState::CustomDataChange,
        PlayerState::AudioTrackChange,
        PlayerState::SubtitleChange,
        PlayerState::Seeking,
    ];

    /// Wire name used in samples
    pub fn name(&self) -> &'static str {
        match self {
            PlayerState::Setup => "setup",
            PlayerState::Startup => "startup",
            PlayerState::Ready => "ready",
            PlayerState::SourceChanged => "sourcechanged",
            PlayerState::Ad => "ad",
            PlayerState::AdFinished => "adfinished",
            PlayerState::Buffering => "rebuffering",
            PlayerState::Error => "error",
            PlayerState::ExitBeforeVideoStart => "exitbeforevideostart",
            PlayerState::Playing => "playing",
            PlayerState::Pause => "paused",
            PlayerState::QualityChange => "qualitychange",
            PlayerState::CustomDataChange => "customdatachange",
            PlayerState::AudioTrackChange => "audiotrackchanged",
            PlayerState::SubtitleChange => "subtitlechange",
            PlayerState::Seeking => "seeking",
        }
    }

    /// States that count as "the player is ready" for first-ready bookkeeping
    pub fn is_ready_like(&self) -> bool {
        matches!(self, PlayerState::Ready | PlayerState::Playing | PlayerState::Pause)
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable error code reported in error samples.
///
/// Adapters map player-native errors into this shape; the collector itself
/// synthesizes the codes defined as associated constructors below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl ErrorCode {
    pub const QUALITY_CHANGE_THRESHOLD_EXCEEDED: i32 = 10000;
    pub const BUFFERING_TIMEOUT_REACHED: i32 = 10001;
    pub const VIDEO_START_TIMEOUT_REACHED: i32 = 10002;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }

    pub fn quality_change_threshold_exceeded() -> Self {
        Self::new(
            Self::QUALITY_CHANGE_THRESHOLD_EXCEEDED,
            "ANALYTICS_QUALITY_CHANGE_THRESHOLD_EXCEEDED",
        )
    }

    pub fn buffering_timeout_reached() -> Self {
        Self::new(Self::BUFFERING_TIMEOUT_REACHED, "ANALYTICS_BUFFERING_TIMEOUT_REACHED")
    }

    pub fn video_start_timeout_reached() -> Self {
        Self::new(
            Self::VIDEO_START_TIMEOUT_REACHED,
            "ANALYTICS_VIDEOSTART_TIMEOUT_REACHED",
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Why a session ended before the first frame was shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VideoStartFailedReason {
    /// Session torn down before the video started
    PageClosed,
    /// Player raised an error during startup
    PlayerError,
    /// Startup did not finish within the configured timeout
    Timeout,
}

impl VideoStartFailedReason {
    /// Synthetic error reported alongside the failure, if any
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            VideoStartFailedReason::Timeout => Some(ErrorCode::video_start_timeout_reached()),
            VideoStartFailedReason::PageClosed | VideoStartFailedReason::PlayerError => None,
        }
    }
}

impl std::fmt::Display for VideoStartFailedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoStartFailedReason::PageClosed => write!(f, "PAGE_CLOSED"),
            VideoStartFailedReason::PlayerError => write!(f, "PLAYER_ERROR"),
            VideoStartFailedReason::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// Free-form customer fields attached to every sample of an impression
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_data_1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_data_2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_data_3: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_data_4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_data_5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_name: Option<String>,
}

/// Streaming format of the current source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    Hls,
    Dash,
    Progressive,
    Smooth,
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamFormat::Hls => write!(f, "hls"),
            StreamFormat::Dash => write!(f, "dash"),
            StreamFormat::Progressive => write!(f, "progressive"),
            StreamFormat::Smooth => write!(f, "smooth"),
        }
    }
}
