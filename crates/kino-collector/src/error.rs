//! Error types for the Kino collector

use thiserror::Error;

/// Result type alias for collector operations
pub type Result<T> = std::result::Result<T, Error>;

/// Collector error types
#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Backend rejected request to {url} with status {status}")]
    HttpStatus { status: u16, url: String },

    #[error("Invalid backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // Encoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Licensing errors
    #[error("Authorization failed: {0}")]
    Authorization(String),

    // Runtime errors
    #[error("No tokio runtime available to drive timers")]
    NoRuntime,

    #[error("Backend worker has shut down")]
    WorkerClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if a delivery that failed with this error may succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            // Without a status the request never completed
            Error::Network(e) => match e.status() {
                Some(status) => is_retryable_status(status.as_u16()),
                None => true,
            },
            Error::HttpStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// Returns a stable tag for logs
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Network(_) => "NETWORK",
            Error::HttpStatus { .. } => "HTTP_STATUS",
            Error::InvalidUrl(_) => "INVALID_URL",
            Error::Serialization(_) => "SERIALIZATION",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Authorization(_) => "AUTHORIZATION",
            Error::NoRuntime => "NO_RUNTIME",
            Error::WorkerClosed => "WORKER_CLOSED",
            Error::Io(_) => "IO",
            Error::Internal(_) => "INTERNAL",
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> Error {
        Error::HttpStatus {
            status,
            url: "https://collector.test/analytics".to_string(),
        }
    }

    #[test]
    fn test_server_errors_are_retryable() {
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(408).is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        assert!(!status(400).is_retryable());
        assert!(!status(403).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!Error::InvalidConfig("x".into()).is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(status(500).error_code(), "HTTP_STATUS");
        assert_eq!(Error::NoRuntime.error_code(), "NO_RUNTIME");
    }
}
