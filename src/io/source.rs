use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Abstraction for retrieving one partition file as a byte blob
/// This trait lets the pipeline fetch from different sources (HTTP CDN,
/// local mirror) with a unified interface
#[async_trait]
pub trait PartitionSource: Send + Sync {
    /// Human-readable location of `file_name` (URL or path), for logs
    fn locate(&self, file_name: &str) -> String;

    /// Retrieve the full content of `file_name`
    /// No retries at this layer; failures are returned to the caller
    async fn fetch(&self, file_name: &str) -> Result<Bytes>;
}
