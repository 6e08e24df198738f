use thiserror::Error;

/// Why a partition failed
///
/// The stage that failed decides the variant. Each carries the rendered
/// error chain so the outcome can be reported after the underlying error
/// (and any connection it held) is gone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PartitionError {
    /// Network/HTTP failure or timeout while fetching the source file
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The source file is not valid Parquet or could not be normalized
    #[error("parse failed: {0}")]
    Parse(String),

    /// Connection, DDL, or write failure against the destination
    #[error("load failed: {0}")]
    Load(String),
}

impl PartitionError {
    pub fn transfer(err: anyhow::Error) -> Self {
        Self::Transfer(format!("{:#}", err))
    }

    pub fn parse(err: anyhow::Error) -> Self {
        Self::Parse(format!("{:#}", err))
    }

    pub fn load(err: anyhow::Error) -> Self {
        Self::Load(format!("{:#}", err))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transfer(_) => "transfer",
            Self::Parse(_) => "parse",
            Self::Load(_) => "load",
        }
    }
}
