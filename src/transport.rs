use crate::config::ClientConfig;
use crate::constants::{DEFAULT_REPLAY_CHUNK_BYTES, NEGOTIATE_PATH, STATUS_PATH};
use crate::types::{snippet, NegotiationRequest, ParleyError, Result, ServiceStatus};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

/// Raw response body of a negotiation stream. Dropping it aborts the transfer.
pub type ChunkStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Opens a negotiation stream for a request.
///
/// A non-success response must be reported as `ParleyError::Upstream` so the controller can
/// surface the status code.
pub trait Transport: Send + Sync + 'static {
    fn open(
        &self,
        request: &NegotiationRequest,
    ) -> impl Future<Output = Result<ChunkStream>> + Send;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(Self::new(config.http_client()?, config.base_url.clone()))
    }

    pub fn negotiate_url(&self) -> String {
        format!("{}{}", self.base_url, NEGOTIATE_PATH)
    }

    pub fn status_url(&self) -> String {
        format!("{}{}", self.base_url, STATUS_PATH)
    }

    /// Probes the negotiation service.
    pub async fn status(&self) -> Result<ServiceStatus> {
        let response = self.client.get(self.status_url()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ParleyError::Upstream(status, snippet(&body)).into());
        }
        let body = response.text().await?;
        let parsed: ServiceStatus = serde_json::from_str(&body)?;
        Ok(parsed)
    }
}

impl Transport for HttpTransport {
    async fn open(&self, request: &NegotiationRequest) -> Result<ChunkStream> {
        let url = self.negotiate_url();
        tracing::debug!("[⚙️  -> ☁️ ] POST {}", url);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("[☁️  -> ⚙️ ] Negotiation service returned {}", status);
            return Err(ParleyError::Upstream(status, snippet(&body)).into());
        }

        let chunks = response.bytes_stream().map(|r| r.map_err(std::io::Error::other));
        Ok(Box::pin(chunks))
    }
}

/// Replays a captured response body, re-chunked at a fixed size.
#[derive(Debug, Clone)]
pub struct ReplayTransport {
    chunks: Vec<Bytes>,
}

impl ReplayTransport {
    pub fn new(chunks: Vec<Bytes>) -> Self {
        Self { chunks }
    }

    pub fn from_body(body: impl Into<Bytes>, chunk_size: usize) -> Self {
        let body: Bytes = body.into();
        let chunk_size = chunk_size.max(1);
        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < body.len() {
            let end = std::cmp::min(offset + chunk_size, body.len());
            chunks.push(body.slice(offset..end));
            offset = end;
        }
        Self { chunks }
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let body = tokio::fs::read(path).await?;
        tracing::info!(
            "Replaying {} bytes from {}",
            body.len(),
            path.display()
        );
        Ok(Self::from_body(body, DEFAULT_REPLAY_CHUNK_BYTES))
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }
}

impl Transport for ReplayTransport {
    async fn open(&self, _request: &NegotiationRequest) -> Result<ChunkStream> {
        let chunks: Vec<std::io::Result<Bytes>> = self.chunks.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}
