//! Sample delivery
//!
//! ```text
//!   dispatcher ──send()──▶ [RetryBackend] ──▶ QueuedBackend ──mpsc──▶ worker ──▶ SampleTransport
//!                              ▲                                          │
//!                              └──────── failed, retryable ◀──────────────┘
//! ```
//!
//! Sends never block the caller: [`QueuedBackend`] hands payloads to a
//! single background worker that delivers them in submission order.

mod http;
mod retry;

pub use http::HttpTransport;
pub use retry::{RetryBackend, RetryPolicy, RetryQueue};

use crate::{
    config::CollectorConfig,
    sample::{AdSample, Sample},
    Error, Result,
};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Anything the backend can deliver
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Sample(Box<Sample>),
    Ad(Box<AdSample>),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Sample(_) => "sample",
            Payload::Ad(_) => "ad",
        }
    }
}

impl From<Sample> for Payload {
    fn from(sample: Sample) -> Self {
        Payload::Sample(Box::new(sample))
    }
}

impl From<AdSample> for Payload {
    fn from(sample: AdSample) -> Self {
        Payload::Ad(Box::new(sample))
    }
}

/// Fire-and-forget delivery of samples
#[async_trait]
pub trait Backend: Send + Sync {
    fn send(&self, sample: Sample);

    fn send_ad_sample(&self, sample: AdSample);

    /// Wait until everything submitted so far has been attempted once
    async fn flush(&self) {}
}

/// Outcome of one delivery attempt
pub type DeliveryCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Delivery that reports its outcome
#[async_trait]
pub trait CallbackBackend: Send + Sync {
    fn send_with_callback(&self, payload: Payload, callback: DeliveryCallback);

    async fn flush(&self) {}
}

/// Performs a single delivery
#[async_trait]
pub trait SampleTransport: Send + Sync {
    async fn deliver(&self, payload: &Payload) -> Result<()>;
}

enum Job {
    Deliver {
        payload: Payload,
        callback: Option<DeliveryCallback>,
    },
    Flush(oneshot::Sender<()>),
}

/// Backend delivering through one background worker, in submission order
#[derive(Debug, Clone)]
pub struct QueuedBackend {
    tx: mpsc::UnboundedSender<Job>,
}

impl QueuedBackend {
    /// Spawn the delivery worker on `handle`.
    ///
    /// The worker exits once every clone of the backend is dropped and the
    /// channel is drained.
    pub fn new(transport: Arc<dyn SampleTransport>, handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Deliver { payload, callback } => {
                        let result = transport.deliver(&payload).await;
                        match &result {
                            Ok(()) => debug!(kind = payload.kind(), "Payload delivered"),
                            Err(e) => warn!(
                                kind = payload.kind(),
                                error = %e,
                                code = e.error_code(),
                                "Payload delivery failed"
                            ),
                        }
                        if let Some(callback) = callback {
                            callback(result);
                        }
                    }
                    Job::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Delivery worker stopped");
        });

        Self { tx }
    }

    fn submit(&self, payload: Payload, callback: Option<DeliveryCallback>) {
        if let Err(mpsc::error::SendError(job)) = self.tx.send(Job::Deliver { payload, callback }) {
            warn!("Delivery worker gone, dropping payload");
            if let Job::Deliver {
                callback: Some(callback),
                ..
            } = job
            {
                callback(Err(Error::WorkerClosed));
            }
        }
    }

    async fn wait_idle(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Job::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

#[async_trait]
impl Backend for QueuedBackend {
    fn send(&self, sample: Sample) {
        self.submit(sample.into(), None);
    }

    fn send_ad_sample(&self, sample: AdSample) {
        self.submit(sample.into(), None);
    }

    async fn flush(&self) {
        self.wait_idle().await;
    }
}

#[async_trait]
impl CallbackBackend for QueuedBackend {
    fn send_with_callback(&self, payload: Payload, callback: DeliveryCallback) {
        self.submit(payload, Some(callback));
    }

    async fn flush(&self) {
        self.wait_idle().await;
    }
}

/// Build the backend selected by `config`, delivering over HTTP
pub fn create_backend(config: &CollectorConfig, handle: &Handle) -> Result<Arc<dyn Backend>> {
    let transport = HttpTransport::new(config)?;
    Ok(create_backend_with_transport(config, Arc::new(transport), handle))
}

/// Build the backend selected by `config` on top of an arbitrary transport
pub fn create_backend_with_transport(
    config: &CollectorConfig,
    transport: Arc<dyn SampleTransport>,
    handle: &Handle,
) -> Arc<dyn Backend> {
    let queued = QueuedBackend::new(transport, handle);
    if config.try_resend_data_on_failed_connection {
        info!(
            max_retries = config.retry.max_retries,
            max_queued = config.retry.max_queued_samples,
            "Resending failed samples"
        );
        Arc::new(RetryBackend::new(queued, RetryPolicy::new(config.retry.clone()), handle))
    } else {
        Arc::new(queued)
    }
}
