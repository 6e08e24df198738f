use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use super::source::PartitionSource;

/// PartitionSource implementation for a local directory mirror of the CDN
#[derive(Clone)]
pub struct LocalSource {
    dir: PathBuf,
}

impl LocalSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl PartitionSource for LocalSource {
    fn locate(&self, file_name: &str) -> String {
        self.dir.join(file_name).display().to_string()
    }

    async fn fetch(&self, file_name: &str) -> Result<Bytes> {
        let path = self.dir.join(file_name);
        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Bytes::from(content))
    }
}
