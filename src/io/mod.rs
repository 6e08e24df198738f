//! I/O abstraction layer for fetching partition files from different sources

pub mod http_source;
pub mod local_source;
pub mod source;
pub mod uri;

pub use http_source::HttpSource;
pub use local_source::LocalSource;
pub use source::PartitionSource;
pub use uri::SourceLocation;

use anyhow::Result;
use std::sync::Arc;

/// Create the PartitionSource matching a parsed location
pub fn open_source(location: &SourceLocation) -> Result<Arc<dyn PartitionSource>> {
    match location {
        SourceLocation::Http(base_url) => Ok(Arc::new(HttpSource::new(base_url.clone())?)),
        SourceLocation::Local(dir) => Ok(Arc::new(LocalSource::new(dir))),
    }
}
