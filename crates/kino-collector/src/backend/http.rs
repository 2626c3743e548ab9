//! HTTP transport for samples

use super::{Payload, SampleTransport};
use crate::{config::CollectorConfig, Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{instrument, trace};
use url::Url;

/// Posts samples as JSON to the collection service
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    analytics_url: Url,
    ad_analytics_url: Url,
}

impl HttpTransport {
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Self::with_client(client, config)
    }

    /// Use a preconfigured client, e.g. one shared with license checks
    pub fn with_client(client: Client, config: &CollectorConfig) -> Result<Self> {
        Ok(Self {
            client,
            analytics_url: config.analytics_url()?,
            ad_analytics_url: config.ad_analytics_url()?,
        })
    }

    fn url_for(&self, payload: &Payload) -> &Url {
        match payload {
            Payload::Sample(_) => &self.analytics_url,
            Payload::Ad(_) => &self.ad_analytics_url,
        }
    }
}

#[async_trait]
impl SampleTransport for HttpTransport {
    #[instrument(skip_all, fields(kind = payload.kind()))]
    async fn deliver(&self, payload: &Payload) -> Result<()> {
        let url = self.url_for(payload);
        let response = self.client.post(url.clone()).json(payload).send().await?;

        let status = response.status();
        trace!(status = status.as_u16(), "Collector responded");
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::AdSample;
    use crate::testing::sample_with_sequence;
    use crate::types::ImpressionId;

    #[test]
    fn test_routes_by_payload_kind() {
        let mut config = CollectorConfig::default();
        config.backend_url = Url::parse("https://collector.test/").unwrap();
        let transport = HttpTransport::new(&config).unwrap();

        let sample: Payload = sample_with_sequence(0).into();
        let ad: Payload = AdSample::new(&config, ImpressionId::new()).into();
        assert_eq!(transport.url_for(&sample).as_str(), "https://collector.test/analytics");
        assert_eq!(transport.url_for(&ad).as_str(), "https://collector.test/analytics/a");
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_retryable() {
        let mut config = CollectorConfig::default();
        // Reserved port, nothing listens there
        config.backend_url = Url::parse("http://127.0.0.1:9/").unwrap();
        config.request_timeout_ms = 500;
        let transport = HttpTransport::new(&config).unwrap();

        let err = transport
            .deliver(&sample_with_sequence(0).into())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
