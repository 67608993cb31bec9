//! Forwarding of client-sent messages to the processing authority.
//!
//! The relay does not route client messages itself. Whatever a client sends
//! after authenticating is handed verbatim to an [`Ingestor`], which is
//! expected to publish any resulting deliveries back onto the backbone.

use crate::error::{RelayError, Result};
use crate::protocol::Payload;
use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Header carrying the authenticated sender on forwarded requests.
pub const USER_HEADER: &str = "x-relay-user";

/// Default size of the per-connection forwarding queue.
pub const DEFAULT_INGEST_QUEUE_SIZE: usize = 64;

/// Receiver of client-originated messages.
#[async_trait]
pub trait Ingestor: Send + Sync + 'static {
    async fn forward(&self, user_id: &str, payload: Payload) -> Result<()>;
}

/// Posts each message body to an HTTP endpoint.
#[derive(Clone)]
pub struct HttpIngestor {
    http_client: reqwest::Client,
    url: String,
}

impl HttpIngestor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Ingestor for HttpIngestor {
    async fn forward(&self, user_id: &str, payload: Payload) -> Result<()> {
        let request = self.http_client.post(&self.url).header(USER_HEADER, user_id);
        let request = match payload {
            Payload::Text(text) => request
                .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(text),
            Payload::Binary(bytes) => request
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes),
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RelayError::Ingest(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Logs and discards client messages.
///
/// Used when no ingestion endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogIngestor;

#[async_trait]
impl Ingestor for LogIngestor {
    async fn forward(&self, user_id: &str, payload: Payload) -> Result<()> {
        info!(
            "Client {} sent {} bytes; no ingestion endpoint configured, discarding",
            user_id,
            payload.len()
        );
        Ok(())
    }
}

/// Per-connection forwarding task.
///
/// Keeps the connection's pump from waiting on the authority. Messages are
/// forwarded in the order they were submitted.
pub struct IngestForwarder {
    tx: mpsc::Sender<Payload>,
    task: JoinHandle<()>,
}

impl IngestForwarder {
    pub fn spawn(ingestor: Arc<dyn Ingestor>, user_id: String, queue_size: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Payload>(queue_size.max(1));
        let task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let Err(e) = ingestor.forward(&user_id, payload).await {
                    warn!("Failed to forward message from {}: {}", user_id, e);
                    counter!("relay_ingest_errors_total").increment(1);
                }
            }
            debug!("Ingest forwarder for {} finished", user_id);
        });
        Self { tx, task }
    }

    /// Queue a message. Returns `false` if the queue is full and it was dropped.
    pub fn submit(&self, payload: Payload) -> bool {
        if self.tx.try_send(payload).is_ok() {
            counter!("relay_ingest_forwarded_total").increment(1);
            true
        } else {
            counter!("relay_ingest_dropped_total").increment(1);
            false
        }
    }

    /// Stop accepting messages; already-queued ones are still forwarded.
    pub fn finish(self) -> JoinHandle<()> {
        drop(self.tx);
        self.task
    }
}
