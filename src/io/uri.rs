use anyhow::{Result, anyhow};
use std::path::PathBuf;
use url::Url;

/// Represents a parsed source base location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// HTTP(S) base URL; files are fetched from `{base}/{file_name}`
    Http(String),
    /// Local directory mirror
    Local(PathBuf),
}

impl SourceLocation {
    /// Parse a base location string into a SourceLocation
    pub fn parse(location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(anyhow!("Source location is empty"));
        }

        // Try parsing as URL first
        match Url::parse(location) {
            Ok(url) => match url.scheme() {
                "http" | "https" => {
                    if url.host_str().is_none() {
                        return Err(anyhow!("Source URL missing host: {}", location));
                    }
                    Ok(SourceLocation::Http(
                        location.trim_end_matches('/').to_string(),
                    ))
                }
                "file" => {
                    let path = url
                        .to_file_path()
                        .map_err(|_| anyhow!("Invalid file:// URI: {}", location))?;
                    Ok(SourceLocation::Local(path))
                }
                // Windows drive letters parse as single-letter schemes
                scheme if scheme.len() == 1 => Ok(SourceLocation::Local(PathBuf::from(location))),
                scheme => Err(anyhow!("Unsupported URI scheme: {}", scheme)),
            },
            // Treat as local directory path
            Err(_) => Ok(SourceLocation::Local(PathBuf::from(location))),
        }
    }
}
