//! Database layer - connection pooling, destination schema, and setup helpers

pub mod pool;
pub mod schema;
pub mod setup;

pub use pool::{Pool, PoolArgsBuilder, PoolTransaction, pool};
