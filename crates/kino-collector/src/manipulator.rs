//! Sample decoration
//!
//! Manipulators run in registration order, so for overlapping fields the
//! last registered manipulator wins. Each one reads its source at call time;
//! nothing is cached between samples.

use crate::{sample::Sample, types::StreamFormat};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A decoration step applied to every sample before dispatch
pub trait SampleManipulator: Send + Sync {
    fn manipulate(&self, sample: &mut Sample);
}

impl<F> SampleManipulator for F
where
    F: Fn(&mut Sample) + Send + Sync,
{
    fn manipulate(&self, sample: &mut Sample) {
        self(sample)
    }
}

/// Ordered list of manipulators
#[derive(Default, Clone)]
pub struct ManipulatorPipeline {
    manipulators: Vec<Arc<dyn SampleManipulator>>,
}

impl ManipulatorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, manipulator: Arc<dyn SampleManipulator>) {
        self.manipulators.push(manipulator);
    }

    /// Drop every manipulator, releasing whatever they reference
    pub fn clear(&mut self) {
        self.manipulators.clear();
    }

    pub fn len(&self) -> usize {
        self.manipulators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manipulators.is_empty()
    }

    pub fn decorate(&self, sample: &mut Sample) {
        for manipulator in &self.manipulators {
            manipulator.manipulate(sample);
        }
    }
}

impl std::fmt::Debug for ManipulatorPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManipulatorPipeline")
            .field("len", &self.manipulators.len())
            .finish()
    }
}

/// Static description of the device running the player
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub platform: Option<String>,
    pub os: Option<String>,
    pub device_model: Option<String>,
    pub language: Option<String>,
    pub user_agent: Option<String>,
}

impl DeviceInfo {
    /// Describe the host the collector runs on
    pub fn host() -> Self {
        Self {
            platform: Some(std::env::consts::ARCH.to_string()),
            os: Some(std::env::consts::OS.to_string()),
            device_model: None,
            language: std::env::var("LANG").ok().filter(|lang| !lang.is_empty()),
            user_agent: Some(format!("kino-collector/{}", crate::VERSION)),
        }
    }
}

/// Stamps device metadata onto samples
#[derive(Debug, Clone)]
pub struct DeviceInfoManipulator {
    info: DeviceInfo,
}

impl DeviceInfoManipulator {
    pub fn new(info: DeviceInfo) -> Self {
        Self { info }
    }
}

impl SampleManipulator for DeviceInfoManipulator {
    fn manipulate(&self, sample: &mut Sample) {
        sample.platform = self.info.platform.clone();
        sample.os = self.info.os.clone();
        sample.device_model = self.info.device_model.clone();
        sample.language = self.info.language.clone();
        sample.user_agent = self.info.user_agent.clone();
    }
}

/// Current rendition and player details as reported by an adapter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackInfo {
    pub video_bitrate: Option<u64>,
    pub audio_bitrate: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub video_duration_ms: Option<u64>,
    pub is_live: Option<bool>,
    pub is_muted: Option<bool>,
    pub drm_type: Option<String>,
    pub stream_format: Option<StreamFormat>,
    pub player: Option<String>,
    pub player_tech: Option<String>,
    pub player_version: Option<String>,
}

/// Supplies live playback details; implemented by player adapters
pub trait PlaybackInfoSource: Send + Sync {
    fn playback_info(&self) -> PlaybackInfo;
}

/// Copies the adapter's current playback details onto samples
pub struct PlaybackInfoManipulator {
    source: Arc<dyn PlaybackInfoSource>,
}

impl PlaybackInfoManipulator {
    pub fn new(source: Arc<dyn PlaybackInfoSource>) -> Self {
        Self { source }
    }
}

impl SampleManipulator for PlaybackInfoManipulator {
    fn manipulate(&self, sample: &mut Sample) {
        let info = self.source.playback_info();
        sample.video_bitrate = info.video_bitrate;
        sample.audio_bitrate = info.audio_bitrate;
        sample.video_playback_width = info.width;
        sample.video_playback_height = info.height;
        sample.video_duration = info.video_duration_ms;
        sample.is_live = info.is_live;
        sample.is_muted = info.is_muted;
        sample.drm_type = info.drm_type;
        sample.stream_format = info.stream_format;
        sample.player = info.player;
        sample.player_tech = info.player_tech;
        sample.player_version = info.player_version;
    }
}
