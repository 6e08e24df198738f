//! File format parsing and normalization

pub mod parquet;
pub mod record;
