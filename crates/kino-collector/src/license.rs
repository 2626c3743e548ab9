//! License authorization
//!
//! Before any sample leaves the process the collection service has to
//! confirm the license key. Until then the dispatcher holds samples back.

use crate::{config::CollectorConfig, sample::ANALYTICS_VERSION, Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use url::Url;

/// Answer of the licensing service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationResult {
    Granted,
    Denied,
}

impl AuthorizationResult {
    pub fn is_granted(&self) -> bool {
        matches!(self, AuthorizationResult::Granted)
    }
}

/// Authorizes a collector session
#[async_trait]
pub trait LicenseProvider: Send + Sync {
    async fn authorize(&self) -> Result<AuthorizationResult>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LicenseRequest<'a> {
    key: &'a str,
    domain: &'a str,
    analytics_version: &'a str,
}

#[derive(Debug, Deserialize)]
struct LicenseResponse {
    status: AuthorizationResult,
    #[serde(default)]
    message: Option<String>,
}

/// Asks the collection service's `licensing` endpoint
#[derive(Debug, Clone)]
pub struct HttpLicenseProvider {
    client: Client,
    url: Url,
    key: String,
    domain: String,
}

impl HttpLicenseProvider {
    pub fn new(config: &CollectorConfig, domain: impl Into<String>) -> Result<Self> {
        if config.license_key.is_empty() {
            return Err(Error::InvalidConfig("license_key is required for authorization".into()));
        }
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            url: config.licensing_url()?,
            key: config.license_key.clone(),
            domain: domain.into(),
        })
    }
}

#[async_trait]
impl LicenseProvider for HttpLicenseProvider {
    #[instrument(skip(self), fields(domain = %self.domain))]
    async fn authorize(&self) -> Result<AuthorizationResult> {
        let request = LicenseRequest {
            key: &self.key,
            domain: &self.domain,
            analytics_version: ANALYTICS_VERSION,
        };
        let response = self.client.post(self.url.clone()).json(&request).send().await?;

        let status = response.status();
        if status.is_client_error() {
            return Err(Error::Authorization(format!(
                "licensing endpoint refused request with status {status}"
            )));
        }
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url: self.url.to_string(),
            });
        }

        let body: LicenseResponse = serde_json::from_slice(&response.bytes().await?)?;
        match body.status {
            AuthorizationResult::Granted => info!("License granted"),
            AuthorizationResult::Denied => warn!(
                message = body.message.as_deref().unwrap_or(""),
                "License denied"
            ),
        }
        Ok(body.status)
    }
}

/// Provider with a fixed answer, for offline runs
#[derive(Debug, Clone, Copy)]
pub struct StaticLicenseProvider(pub AuthorizationResult);

impl StaticLicenseProvider {
    pub fn granted() -> Self {
        Self(AuthorizationResult::Granted)
    }

    pub fn denied() -> Self {
        Self(AuthorizationResult::Denied)
    }
}

#[async_trait]
impl LicenseProvider for StaticLicenseProvider {
    async fn authorize(&self) -> Result<AuthorizationResult> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let request = LicenseRequest {
            key: "abc",
            domain: "kino.local",
            analytics_version: "1.0.0",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["key"], "abc");
        assert_eq!(json["analyticsVersion"], "1.0.0");
    }

    #[test]
    fn test_response_parsing() {
        let granted: LicenseResponse = serde_json::from_str(r#"{"status":"granted"}"#).unwrap();
        assert!(granted.status.is_granted());

        let denied: LicenseResponse =
            serde_json::from_str(r#"{"status":"denied","message":"unknown key"}"#).unwrap();
        assert_eq!(denied.status, AuthorizationResult::Denied);
        assert_eq!(denied.message.as_deref(), Some("unknown key"));
    }

    #[test]
    fn test_missing_key_rejected() {
        let result = HttpLicenseProvider::new(&CollectorConfig::default(), "kino.local");
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_static_provider() {
        assert_eq!(
            StaticLicenseProvider::denied().authorize().await.unwrap(),
            AuthorizationResult::Denied
        );
    }
}
