use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use std::time::Duration;

use super::source::PartitionSource;
use crate::config::FETCH_TIMEOUT;

/// Upper bound on the body buffer reserved from a Content-Length header
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// PartitionSource implementation for files served over HTTP(S)
#[derive(Clone)]
pub struct HttpSource {
    client: Client,
    base_url: String,
}

impl HttpSource {
    /// Create a new HttpSource rooted at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, FETCH_TIMEOUT)
    }

    /// Like [`HttpSource::new`], with a custom bound on each whole transfer
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl PartitionSource for HttpSource {
    fn locate(&self, file_name: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), file_name)
    }

    async fn fetch(&self, file_name: &str) -> Result<Bytes> {
        let url = self.locate(file_name);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?
            .error_for_status()
            .with_context(|| format!("Server rejected request for {}", url))?;

        // Stream the body so a stalled transfer hits the client timeout
        let mut body = match response.content_length() {
            Some(len) => BytesMut::with_capacity(len.min(MAX_PREALLOCATION) as usize),
            None => BytesMut::new(),
        };
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Failed to download {}", url))?;
            body.extend_from_slice(&chunk);
        }

        Ok(body.freeze())
    }
}
