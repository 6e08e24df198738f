//! The ingestion pipeline: partitions, the bulk loader, and the run orchestrator

pub mod error;
pub mod loader;
pub mod orchestrator;
pub mod partition;

pub use error::PartitionError;
pub use loader::BulkLoader;
pub use orchestrator::{OnFailure, Operator, PartitionOutcome, Pipeline, RunSummary};
pub use partition::{Partition, PartitionState, Selection, SourceLayout};
