//! Parquet blob reader.

use anyhow::{Context, Result};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::debug;

/// A parsed partition file, columns as the source describes them
#[derive(Debug, Clone)]
pub struct RawTable {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

#[cfg(test)]
impl RawTable {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }
}

/// Parse an in-memory Parquet file into Arrow RecordBatches
///
/// The schema comes from the file footer. Batches hold at most `batch_size`
/// rows so the loader can write them without re-slicing.
pub fn read_parquet(blob: Bytes, batch_size: usize) -> Result<RawTable> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(blob)
        .context("Source is not a valid Parquet file")?;

    let metadata = builder.metadata().clone();
    debug!(
        row_groups = metadata.num_row_groups(),
        rows = metadata.file_metadata().num_rows(),
        "Parsed Parquet footer"
    );

    let schema = builder.schema().clone();
    let reader = builder
        .with_batch_size(batch_size.max(1))
        .build()
        .context("Failed to build Parquet reader")?;

    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to read record batch")?;

    Ok(RawTable { schema, batches })
}
