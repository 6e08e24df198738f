use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// A single typed cell value
///
/// Variants mirror the SQL types the loader creates, so binding never has to
/// re-parse text. Nulls are represented by `None` in the owning [`Record`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
}

/// A single record (row) ready to be bound to an INSERT
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub values: Vec<Option<Value>>,
}
