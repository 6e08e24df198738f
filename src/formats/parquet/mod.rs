//! Parquet support for the trip-record loader.
//!
//! This module turns a downloaded partition file into a typed, load-ready table:
//! - Reading the self-describing Parquet blob into Arrow RecordBatches
//! - Normalizing column names and coercing a fixed set of columns to
//!   canonical types so every partition appends cleanly
//! - Conversion from Arrow RecordBatches to row-based Records for binding

mod conversion;
mod normalize;
mod reader;

pub use conversion::record_batch_to_records;
pub use normalize::{NormalizedTable, normalize};
pub use reader::{RawTable, read_parquet};
