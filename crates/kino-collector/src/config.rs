//! Collector configuration
//!
//! Every timing constant the state machine and the delivery layer rely on is
//! configurable here. Defaults match the values production collectors ship
//! with.

use crate::{types::CustomData, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8787/";

/// Collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// License key sent with every sample and used for authorization
    pub license_key: String,
    /// Base URL of the collection service
    pub backend_url: Url,
    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Heartbeat interval while playing, in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Heartbeat schedule while rebuffering; the last entry repeats
    pub rebuffering_heartbeat_intervals_ms: Vec<u64>,
    /// Maximum time spent in startup before the video start is declared failed
    pub startup_timeout_ms: u64,
    /// Maximum time spent rebuffering before an error is forced
    pub rebuffering_timeout_ms: u64,
    /// Window after which the quality change counter resets
    pub quality_change_window_ms: u64,
    /// Quality changes allowed per window before they are reported as an error
    pub quality_change_threshold: u32,
    /// Re-send samples whose delivery failed
    pub try_resend_data_on_failed_connection: bool,
    /// Retry policy used when re-sending is enabled
    pub retry: RetryConfig,
    /// Custom data every new impression starts with
    pub custom_data: CustomData,
    pub title: Option<String>,
    pub video_id: Option<String>,
    pub cdn_provider: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            license_key: String::new(),
            backend_url: default_backend_url(),
            request_timeout_ms: 10_000,
            heartbeat_interval_ms: 59_700,
            rebuffering_heartbeat_intervals_ms: vec![3_000, 5_000, 10_000, 30_000, 59_700],
            startup_timeout_ms: 60_000,
            rebuffering_timeout_ms: 120_000,
            quality_change_window_ms: 60 * 60 * 1000,
            quality_change_threshold: 50,
            try_resend_data_on_failed_connection: false,
            retry: RetryConfig::default(),
            custom_data: CustomData::default(),
            title: None,
            video_id: None,
            cdn_provider: None,
        }
    }
}

fn default_backend_url() -> Url {
    Url::parse(DEFAULT_BACKEND_URL).expect("Default backend url is valid")
}

impl CollectorConfig {
    /// Create a configuration for the given license key
    pub fn new(license_key: impl Into<String>) -> Self {
        Self {
            license_key: license_key.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check that timing values are usable
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("startup_timeout_ms", self.startup_timeout_ms),
            ("rebuffering_timeout_ms", self.rebuffering_timeout_ms),
            ("quality_change_window_ms", self.quality_change_window_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be greater than zero")));
            }
        }

        if self.rebuffering_heartbeat_intervals_ms.is_empty()
            || self.rebuffering_heartbeat_intervals_ms.contains(&0)
        {
            return Err(Error::InvalidConfig(
                "rebuffering_heartbeat_intervals_ms must contain positive intervals".into(),
            ));
        }

        if self.quality_change_threshold == 0 {
            return Err(Error::InvalidConfig(
                "quality_change_threshold must be greater than zero".into(),
            ));
        }

        if self.backend_url.cannot_be_a_base() {
            return Err(Error::InvalidConfig(format!(
                "backend_url {} cannot be used as a base url",
                self.backend_url
            )));
        }

        self.retry.validate()
    }

    /// Endpoint receiving playback samples
    pub fn analytics_url(&self) -> Result<Url> {
        Ok(self.backend_url.join("analytics")?)
    }

    /// Endpoint receiving ad samples
    pub fn ad_analytics_url(&self) -> Result<Url> {
        Ok(self.backend_url.join("analytics/a")?)
    }

    /// Endpoint answering authorization requests
    pub fn licensing_url(&self) -> Result<Url> {
        Ok(self.backend_url.join("licensing")?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn rebuffering_timeout(&self) -> Duration {
        Duration::from_millis(self.rebuffering_timeout_ms)
    }

    pub fn quality_change_window(&self) -> Duration {
        Duration::from_millis(self.quality_change_window_ms)
    }

    /// Delay before the n-th rebuffering heartbeat (0-based)
    pub fn rebuffering_heartbeat_interval(&self, index: usize) -> Duration {
        let intervals = &self.rebuffering_heartbeat_intervals_ms;
        let ms = intervals
            .get(index)
            .or_else(|| intervals.last())
            .copied()
            .unwrap_or(self.heartbeat_interval_ms);
        Duration::from_millis(ms)
    }
}

/// Resend policy for failed deliveries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts after the first failed one
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound for the exponential delay
    pub max_delay_ms: u64,
    /// Samples older than this are dropped instead of re-sent
    pub max_sample_age_ms: u64,
    /// Queue capacity; the oldest entry is dropped on overflow
    pub max_queued_samples: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay_ms: 1_000,
            max_delay_ms: 64_000,
            max_sample_age_ms: 5 * 60 * 1000,
            max_queued_samples: 100,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_queued_samples == 0 {
            return Err(Error::InvalidConfig("retry.max_queued_samples must be greater than zero".into()));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::InvalidConfig(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based); zero for attempt 0
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempt - 1);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn max_sample_age(&self) -> Duration {
        Duration::from_millis(self.max_sample_age_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollectorConfig::default();
        assert_eq!(config.heartbeat_interval_ms, 59_700);
        assert_eq!(config.startup_timeout_ms, 60_000);
        assert_eq!(config.rebuffering_timeout_ms, 120_000);
        assert_eq!(config.quality_change_threshold, 50);
        assert!(!config.try_resend_data_on_failed_connection);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoints_join_base() {
        let mut config = CollectorConfig::default();
        config.backend_url = Url::parse("https://collector.test/v1/").unwrap();
        assert_eq!(config.analytics_url().unwrap().as_str(), "https://collector.test/v1/analytics");
        assert_eq!(config.ad_analytics_url().unwrap().as_str(), "https://collector.test/v1/analytics/a");
        assert_eq!(config.licensing_url().unwrap().as_str(), "https://collector.test/v1/licensing");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CollectorConfig::from_json_str(
            r#"{ "license_key": "abc", "quality_change_threshold": 5 }"#,
        )
        .unwrap();
        assert_eq!(config.license_key, "abc");
        assert_eq!(config.quality_change_threshold, 5);
        assert_eq!(config.heartbeat_interval_ms, 59_700);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = CollectorConfig::from_json_str(r#"{ "heartbeat_interval_ms": 0 }"#);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_rebuffer_schedule_rejected() {
        let mut config = CollectorConfig::default();
        config.rebuffering_heartbeat_intervals_ms.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rebuffering_heartbeat_schedule_repeats_last() {
        let config = CollectorConfig::default();
        assert_eq!(config.rebuffering_heartbeat_interval(0), Duration::from_secs(3));
        assert_eq!(config.rebuffering_heartbeat_interval(3), Duration::from_secs(30));
        assert_eq!(config.rebuffering_heartbeat_interval(4), Duration::from_millis(59_700));
        assert_eq!(config.rebuffering_heartbeat_interval(10), Duration::from_millis(59_700));
    }

    #[test]
    fn test_retry_delay_backoff() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(retry.delay_for_attempt(12), Duration::from_secs(64));
    }
}
