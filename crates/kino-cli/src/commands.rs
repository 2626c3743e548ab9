//! CLI command implementations

use crate::output::{self, SimulationReport};
use crate::script;
use async_trait::async_trait;
use kino_collector::{
    create_backend_with_transport, Collector, CollectorConfig, DispatchState, HttpLicenseProvider,
    HttpTransport, LicenseProvider, Payload, SampleTransport, StaticLicenseProvider,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

const CLI_DOMAIN: &str = "kino-analytics-cli";

/// Load the configuration file, or defaults when none is given
pub fn load_config(path: Option<&Path>) -> anyhow::Result<CollectorConfig> {
    let config = match path {
        Some(path) => CollectorConfig::from_file(path)?,
        None => {
            let config = CollectorConfig::default();
            config.validate()?;
            config
        }
    };
    Ok(config)
}

/// Print the effective configuration
pub fn show_config(path: Option<&Path>, format: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;
    match format {
        "json" | "text" | "table" => println!("{}", serde_json::to_string_pretty(&config)?),
        other => anyhow::bail!("Unsupported format: {other}"),
    }
    Ok(())
}

/// Writes every payload to stdout as one JSON line
struct StdoutTransport;

#[async_trait]
impl SampleTransport for StdoutTransport {
    async fn deliver(&self, payload: &Payload) -> kino_collector::Result<()> {
        println!("{}", serde_json::to_string(payload)?);
        Ok(())
    }
}

/// Counts deliveries per sample state
struct TallyTransport {
    inner: Arc<dyn SampleTransport>,
    delivered: Mutex<BTreeMap<String, usize>>,
    failed: AtomicUsize,
}

impl TallyTransport {
    fn new(inner: Arc<dyn SampleTransport>) -> Self {
        Self {
            inner,
            delivered: Mutex::new(BTreeMap::new()),
            failed: AtomicUsize::new(0),
        }
    }

    fn delivered(&self) -> BTreeMap<String, usize> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SampleTransport for TallyTransport {
    async fn deliver(&self, payload: &Payload) -> kino_collector::Result<()> {
        let result = self.inner.deliver(payload).await;
        let key = match payload {
            Payload::Sample(sample) => sample.state.clone(),
            Payload::Ad(_) => "ad".to_string(),
        };
        match &result {
            Ok(()) => {
                if let Ok(mut delivered) = self.delivered.lock() {
                    *delivered.entry(key).or_default() += 1;
                }
            }
            Err(e) => {
                debug!(kind = payload.kind(), error = %e, "Delivery failed");
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }
}

/// Replay a session script against the collector
pub async fn simulate(
    script_path: &Path,
    config_path: Option<&Path>,
    backend_url: Option<&str>,
    dry_run: bool,
    format: &str,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(url) = backend_url {
        config.backend_url = Url::parse(url)?;
        config.validate()?;
    }
    let steps = script::load(script_path)?;
    info!(steps = steps.len(), dry_run, "Replaying {}", script_path.display());

    let handle = Handle::current();
    let (sink, license): (Arc<dyn SampleTransport>, Arc<dyn LicenseProvider>) = if dry_run {
        (Arc::new(StdoutTransport), Arc::new(StaticLicenseProvider::granted()))
    } else {
        (
            Arc::new(HttpTransport::new(&config)?),
            Arc::new(HttpLicenseProvider::new(&config, CLI_DOMAIN)?),
        )
    };
    let tally = Arc::new(TallyTransport::new(sink));
    let backend = create_backend_with_transport(&config, tally.clone(), &handle);
    let authorization_timeout = config.request_timeout() + Duration::from_secs(1);
    let collector = Collector::with_parts(config, backend.clone(), license, handle);

    collector.attach();
    let mut status = collector.dispatcher().subscribe_status();
    let settled = tokio::time::timeout(
        authorization_timeout,
        status.wait_for(|s| *s != DispatchState::PendingAuthorization),
    )
    .await
    .is_ok_and(|changed| changed.is_ok());
    if !settled {
        warn!("Authorization still pending, samples stay queued");
    }

    let start = Instant::now();
    for step in &steps {
        tokio::time::sleep_until(start + Duration::from_millis(step.at_ms)).await;
        debug!(at_ms = step.at_ms, state = ?step.state, "Applying step");
        step.apply(&collector);
    }

    let impression_id = collector.impression_id();
    let final_state = collector.machine().current_state();
    let dispatch_state = collector.dispatcher().state();
    collector.detach();
    backend.flush().await;

    let report = SimulationReport {
        impression_id: impression_id.to_string(),
        steps: steps.len(),
        elapsed_ms: start.elapsed().as_millis() as u64,
        final_state: final_state.name().to_string(),
        dispatch_state: dispatch_state.to_string(),
        delivered: tally.delivered(),
        failed: tally.failed(),
    };
    output::print_report(&report, format);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kino_collector::testing::sample_with_sequence;

    #[tokio::test]
    async fn test_tally_counts_by_state() {
        let tally = TallyTransport::new(Arc::new(kino_collector::testing::RecordingTransport::default()));
        let mut playing = sample_with_sequence(0);
        playing.state = "playing".into();
        tally.deliver(&Payload::from(playing.clone())).await.unwrap();
        tally.deliver(&Payload::from(playing)).await.unwrap();

        assert_eq!(tally.delivered().get("playing"), Some(&2));
        assert_eq!(tally.failed(), 0);
    }

    #[tokio::test]
    async fn test_tally_counts_failures() {
        let tally = TallyTransport::new(Arc::new(
            kino_collector::testing::RecordingTransport::failing_with(500),
        ));
        assert!(tally.deliver(&Payload::from(sample_with_sequence(0))).await.is_err());
        assert_eq!(tally.failed(), 1);
        assert!(tally.delivered().is_empty());
    }

    #[test]
    fn test_default_config_loads() {
        let config = load_config(None).unwrap();
        assert!(!config.try_resend_data_on_failed_connection);
    }
}
