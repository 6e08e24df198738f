//! Conversion from Arrow RecordBatch to row-based Records.
//!
//! Each column is first cast to the canonical Arrow type of its SQL column, so
//! extraction only has to handle one physical layout per SQL type. Nulls stay
//! `None` all the way to the bind step.

use anyhow::{Context, Result, anyhow};
use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::kernels::cast::{CastOptions, cast_with_options};
use arrow::datatypes::{
    Date32Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type,
    TimestampMicrosecondType,
};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate};

use crate::db::schema::SqlType;
use crate::formats::record::{Record, Value};

/// Convert an Arrow RecordBatch to a vector of Records
///
/// Values are typed according to [`SqlType::from_arrow`] for each column.
pub fn record_batch_to_records(batch: &RecordBatch) -> Result<Vec<Record>> {
    let num_rows = batch.num_rows();

    if num_rows == 0 {
        return Ok(Vec::new());
    }

    let schema = batch.schema();
    let mut columns: Vec<Vec<Option<Value>>> = Vec::with_capacity(batch.num_columns());
    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        let values = array_to_values(array).with_context(|| {
            format!(
                "Failed to convert column '{}' ({:?})",
                field.name(),
                array.data_type()
            )
        })?;
        columns.push(values);
    }

    // Transpose to rows
    let mut iters: Vec<_> = columns.into_iter().map(|c| c.into_iter()).collect();
    let mut records = Vec::with_capacity(num_rows);
    for _ in 0..num_rows {
        let values = iters
            .iter_mut()
            .map(|col| col.next().flatten())
            .collect();
        records.push(Record { values });
    }

    Ok(records)
}

/// Convert an Arrow array to typed values
fn array_to_values(array: &ArrayRef) -> Result<Vec<Option<Value>>> {
    let sql_type = SqlType::from_arrow(array.data_type())?;
    let target = sql_type.arrow_type();

    let canonical = if array.data_type() == &target {
        array.clone()
    } else {
        let options = CastOptions {
            safe: false,
            ..Default::default()
        };
        cast_with_options(array, &target, &options)?
    };

    let values: Vec<Option<Value>> = match sql_type {
        SqlType::Boolean => canonical
            .as_boolean()
            .iter()
            .map(|v| v.map(Value::Boolean))
            .collect(),
        SqlType::SmallInt => canonical
            .as_primitive::<Int16Type>()
            .iter()
            .map(|v| v.map(Value::SmallInt))
            .collect(),
        SqlType::Integer => canonical
            .as_primitive::<Int32Type>()
            .iter()
            .map(|v| v.map(Value::Integer))
            .collect(),
        SqlType::BigInt => canonical
            .as_primitive::<Int64Type>()
            .iter()
            .map(|v| v.map(Value::BigInt))
            .collect(),
        SqlType::Real => canonical
            .as_primitive::<Float32Type>()
            .iter()
            .map(|v| v.map(Value::Real))
            .collect(),
        SqlType::DoublePrecision => canonical
            .as_primitive::<Float64Type>()
            .iter()
            .map(|v| v.map(Value::Double))
            .collect(),
        SqlType::Text => canonical
            .as_string::<i32>()
            .iter()
            .map(|v| v.map(|s| Value::Text(s.to_string())))
            .collect(),
        SqlType::Timestamp => canonical
            .as_primitive::<TimestampMicrosecondType>()
            .iter()
            .map(|v| v.map(micros_to_datetime).transpose())
            .map(|v| v.map(|o| o.map(|dt| Value::Timestamp(dt.naive_utc()))))
            .collect::<Result<_>>()?,
        SqlType::TimestampTz => canonical
            .as_primitive::<TimestampMicrosecondType>()
            .iter()
            .map(|v| v.map(micros_to_datetime).transpose())
            .map(|v| v.map(|o| o.map(Value::TimestampTz)))
            .collect::<Result<_>>()?,
        SqlType::Date => canonical
            .as_primitive::<Date32Type>()
            .iter()
            .map(|v| v.map(days_to_date).transpose())
            .map(|v| v.map(|o| o.map(Value::Date)))
            .collect::<Result<_>>()?,
    };

    Ok(values)
}

fn micros_to_datetime(micros: i64) -> Result<DateTime<chrono::Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| anyhow!("Timestamp out of range: {} microseconds", micros))
}

fn days_to_date(days: i32) -> Result<NaiveDate> {
    DateTime::from_timestamp(i64::from(days) * 86_400, 0)
        .map(|dt| dt.date_naive())
        .ok_or_else(|| anyhow!("Date out of range: {} days since epoch", days))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{
        BooleanArray, Date32Array, Float32Array, Float64Array, Int8Array, Int64Array,
        StringArray, TimestampMicrosecondArray, TimestampNanosecondArray, UInt32Array,
    };
    use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
    use std::sync::Arc;

    fn batch(fields: Vec<Field>, columns: Vec<ArrayRef>) -> RecordBatch {
        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).unwrap()
    }

    #[test]
    fn test_empty_batch_yields_no_records() {
        let b = batch(
            vec![Field::new("a", DataType::Int64, true)],
            vec![Arc::new(Int64Array::from(Vec::<i64>::new()))],
        );
        assert!(record_batch_to_records(&b).unwrap().is_empty());
    }

    #[test]
    fn test_rows_are_transposed_with_nulls() {
        let b = batch(
            vec![
                Field::new("vendorid", DataType::Int64, true),
                Field::new("fare_amount", DataType::Float64, true),
                Field::new("store_and_fwd_flag", DataType::Utf8, true),
            ],
            vec![
                Arc::new(Int64Array::from(vec![Some(1), None])),
                Arc::new(Float64Array::from(vec![Some(9.5), Some(3.0)])),
                Arc::new(StringArray::from(vec![None, Some("Y")])),
            ],
        );

        let records = record_batch_to_records(&b).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].values,
            vec![Some(Value::BigInt(1)), Some(Value::Double(9.5)), None]
        );
        assert_eq!(
            records[1].values,
            vec![
                None,
                Some(Value::Double(3.0)),
                Some(Value::Text("Y".to_string()))
            ]
        );
    }

    #[test]
    fn test_narrow_and_unsigned_types_widen() {
        let b = batch(
            vec![
                Field::new("small", DataType::Int8, true),
                Field::new("unsigned", DataType::UInt32, true),
                Field::new("single", DataType::Float32, true),
                Field::new("flag", DataType::Boolean, true),
            ],
            vec![
                Arc::new(Int8Array::from(vec![-3])),
                Arc::new(UInt32Array::from(vec![4_000_000_000])),
                Arc::new(Float32Array::from(vec![0.5])),
                Arc::new(BooleanArray::from(vec![true])),
            ],
        );

        let records = record_batch_to_records(&b).unwrap();
        assert_eq!(
            records[0].values,
            vec![
                Some(Value::SmallInt(-3)),
                Some(Value::BigInt(4_000_000_000)),
                Some(Value::Real(0.5)),
                Some(Value::Boolean(true)),
            ]
        );
    }

    #[test]
    fn test_temporal_values() {
        let pickup = NaiveDate::from_ymd_opt(2013, 1, 1)
            .unwrap()
            .and_hms_opt(0, 15, 30)
            .unwrap();
        let micros = pickup.and_utc().timestamp_micros();

        let b = batch(
            vec![
                Field::new(
                    "tpep_pickup_datetime",
                    DataType::Timestamp(TimeUnit::Microsecond, None),
                    true,
                ),
                Field::new(
                    "dropoff_ns",
                    DataType::Timestamp(TimeUnit::Nanosecond, None),
                    true,
                ),
                Field::new(
                    "stamped",
                    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                    true,
                ),
                Field::new("day", DataType::Date32, true),
            ],
            vec![
                Arc::new(TimestampMicrosecondArray::from(vec![micros])),
                Arc::new(TimestampNanosecondArray::from(vec![micros * 1_000])),
                Arc::new(TimestampMicrosecondArray::from(vec![micros]).with_timezone("UTC")),
                Arc::new(Date32Array::from(vec![15706])),
            ],
        );

        let records = record_batch_to_records(&b).unwrap();
        assert_eq!(
            records[0].values,
            vec![
                Some(Value::Timestamp(pickup)),
                Some(Value::Timestamp(pickup)),
                Some(Value::TimestampTz(pickup.and_utc())),
                Some(Value::Date(NaiveDate::from_ymd_opt(2013, 1, 1).unwrap())),
            ]
        );
    }

    #[test]
    fn test_unsupported_type_is_an_error() {
        let b = batch(
            vec![Field::new("blob", DataType::Binary, true)],
            vec![Arc::new(arrow::array::BinaryArray::from(vec![
                b"x".as_ref(),
            ]))],
        );

        let err = record_batch_to_records(&b).unwrap_err();
        assert!(format!("{:#}", err).contains("blob"));
    }
}
