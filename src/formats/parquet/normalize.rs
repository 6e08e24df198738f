//! Schema normalization for trip-record partitions.
//!
//! Upstream files drift across dataset vintages: column names change case,
//! optional columns come and go, and identifiers switch between integer and
//! float encodings. Normalization pins every partition to one shape so
//! append loads never violate the destination table's typing.

use anyhow::{Context, Result, bail};
use arrow::array::{Array, ArrayRef, AsArray, StringArray, TimestampMicrosecondArray};
use arrow::compute::kernels::cast::{CastOptions, cast_with_options};
use arrow::datatypes::{DataType, Field, Float64Type, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDateTime;
use std::collections::HashSet;
use std::sync::Arc;

use super::reader::RawTable;
use crate::db::schema::SqlType;

/// Provenance column: wall-clock time the partition was normalized
pub const LOAD_DATE_COLUMN: &str = "load_date";

/// Provenance column: name of the partition file the row came from
pub const SOURCE_FILE_COLUMN: &str = "source_file";

/// Target semantic type for a coerced column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// String representation; nulls stay null
    Text,
    /// 64-bit float
    Float64,
    /// 64-bit integer that keeps missing values as null
    NullableInt64,
}

/// Columns coerced after lower-casing, applied in this order
///
/// Columns absent from a partition are skipped.
pub const COLUMN_COERCIONS: &[(&str, Coercion)] = &[
    ("store_and_fwd_flag", Coercion::Text),
    ("trip_distance", Coercion::Float64),
    ("fare_amount", Coercion::Float64),
    ("extra", Coercion::Float64),
    ("mta_tax", Coercion::Float64),
    ("tip_amount", Coercion::Float64),
    ("tolls_amount", Coercion::Float64),
    ("improvement_surcharge", Coercion::Float64),
    ("total_amount", Coercion::Float64),
    ("vendorid", Coercion::NullableInt64),
    ("passenger_count", Coercion::NullableInt64),
    ("pulocationid", Coercion::NullableInt64),
    ("dolocationid", Coercion::NullableInt64),
    ("ratecodeid", Coercion::NullableInt64),
    ("payment_type", Coercion::NullableInt64),
];

// i64::MAX as f64 rounds up to 2^63, which is already out of range
const MAX_EXACT_INT64_AS_F64: f64 = 9_223_372_036_854_775_807.0;

impl Coercion {
    pub fn target_type(&self) -> DataType {
        match self {
            Coercion::Text => DataType::Utf8,
            Coercion::Float64 => DataType::Float64,
            Coercion::NullableInt64 => DataType::Int64,
        }
    }

    /// Coerce an array to the target type
    ///
    /// Unlike arrow's default (safe) cast, a value that cannot be represented
    /// is an error rather than a silent null.
    fn apply(&self, array: &ArrayRef) -> Result<ArrayRef> {
        let target = self.target_type();
        if array.data_type() == &target {
            return Ok(Arc::clone(array));
        }

        let strict = CastOptions {
            safe: false,
            ..Default::default()
        };

        match self {
            Coercion::NullableInt64 if is_float(array.data_type()) => {
                let floats = cast_with_options(array, &DataType::Float64, &strict)?;
                for value in floats.as_primitive::<Float64Type>().iter().flatten() {
                    if !value.is_finite() {
                        continue;
                    }
                    if value.fract() != 0.0 || value.abs() >= MAX_EXACT_INT64_AS_F64 {
                        bail!("Cannot represent {} as a 64-bit integer", value);
                    }
                }
                // Safe cast: the values were checked above, NaN/inf become null
                Ok(cast_with_options(&floats, &target, &CastOptions::default())?)
            }
            _ => Ok(cast_with_options(array, &target, &strict)?),
        }
    }
}

fn is_float(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Float16 | DataType::Float32 | DataType::Float64
    )
}

/// A partition coerced to the canonical schema, with provenance columns
#[derive(Debug, Clone)]
pub struct NormalizedTable {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    source_file: String,
}

impl NormalizedTable {
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn source_file(&self) -> &str {
        &self.source_file
    }
}

/// How each output column is produced from the input batch
#[derive(Debug, Clone, Copy)]
enum ColumnPlan {
    Keep(usize),
    Coerce(usize, Coercion),
}

/// Normalize a parsed partition
///
/// 1. Lower-case column names
/// 2. Append `load_date` and `source_file`
/// 3. Apply [`COLUMN_COERCIONS`] to the columns that are present
pub fn normalize(
    raw: RawTable,
    source_file: &str,
    loaded_at: NaiveDateTime,
) -> Result<NormalizedTable> {
    let (plans, schema) = plan_columns(&raw.schema)?;

    let loaded_at_micros = loaded_at.and_utc().timestamp_micros();

    let batches = raw
        .batches
        .iter()
        .map(|batch| {
            let num_rows = batch.num_rows();
            let mut columns: Vec<ArrayRef> = Vec::with_capacity(plans.len() + 2);

            for (out_idx, plan) in plans.iter().enumerate() {
                match *plan {
                    ColumnPlan::Keep(idx) => columns.push(Arc::clone(batch.column(idx))),
                    ColumnPlan::Coerce(idx, coercion) => {
                        let name = schema.field(out_idx).name();
                        let coerced = coercion.apply(batch.column(idx)).with_context(|| {
                            format!("Failed to coerce column '{}' to {:?}", name, coercion)
                        })?;
                        columns.push(coerced);
                    }
                }
            }

            columns.push(Arc::new(TimestampMicrosecondArray::from_value(
                loaded_at_micros,
                num_rows,
            )));
            columns.push(Arc::new(StringArray::from_iter_values(
                std::iter::repeat_n(source_file, num_rows),
            )));

            RecordBatch::try_new(Arc::clone(&schema), columns)
                .context("Failed to assemble normalized batch")
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(NormalizedTable {
        schema,
        batches,
        source_file: source_file.to_string(),
    })
}

/// Build the normalized schema and the per-column plan that produces it
fn plan_columns(input: &Schema) -> Result<(Vec<ColumnPlan>, SchemaRef)> {
    let mut seen = HashSet::new();
    let mut plans = Vec::with_capacity(input.fields().len());
    let mut fields = Vec::with_capacity(input.fields().len() + 2);

    for (idx, field) in input.fields().iter().enumerate() {
        let name = field.name().to_lowercase();

        // Provenance columns are always regenerated
        if name == LOAD_DATE_COLUMN || name == SOURCE_FILE_COLUMN {
            continue;
        }

        if !seen.insert(name.clone()) {
            bail!(
                "Column '{}' collides with another column after lower-casing",
                field.name()
            );
        }

        let coercion = COLUMN_COERCIONS
            .iter()
            .find(|(column, _)| *column == name)
            .map(|(_, coercion)| *coercion);

        match coercion {
            Some(coercion) => {
                fields.push(Field::new(name, coercion.target_type(), true));
                plans.push(ColumnPlan::Coerce(idx, coercion));
            }
            None => {
                // Every kept column must have a destination type
                SqlType::from_arrow(field.data_type())
                    .with_context(|| format!("Column '{}' cannot be loaded", name))?;
                fields.push(field.as_ref().clone().with_name(name));
                plans.push(ColumnPlan::Keep(idx));
            }
        }
    }

    fields.push(Field::new(
        LOAD_DATE_COLUMN,
        DataType::Timestamp(TimeUnit::Microsecond, None),
        false,
    ));
    fields.push(Field::new(SOURCE_FILE_COLUMN, DataType::Utf8, false));

    Ok((plans, Arc::new(Schema::new(fields))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{BinaryArray, Float64Array, Int32Array, Int64Array};
    use arrow::datatypes::Int64Type;
    use chrono::NaiveDate;

    fn loaded_at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn raw_table(fields: Vec<Field>, columns: Vec<ArrayRef>) -> RawTable {
        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(Arc::clone(&schema), columns).unwrap();
        RawTable {
            schema,
            batches: vec![batch],
        }
    }

    fn column_names(table: &NormalizedTable) -> Vec<String> {
        table
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    fn trip_table() -> RawTable {
        raw_table(
            vec![
                Field::new("VendorID", DataType::Int32, true),
                Field::new("passenger_count", DataType::Float64, true),
                Field::new("Trip_Distance", DataType::Float32, true),
                Field::new("store_and_fwd_flag", DataType::Utf8, true),
                Field::new("total_amount", DataType::Int64, true),
            ],
            vec![
                Arc::new(Int32Array::from(vec![Some(1), None, Some(2)])),
                Arc::new(Float64Array::from(vec![Some(1.0), Some(3.0), None])),
                Arc::new(arrow::array::Float32Array::from(vec![1.5, 0.25, 10.0])),
                Arc::new(StringArray::from(vec![Some("N"), None, Some("Y")])),
                Arc::new(Int64Array::from(vec![10, 20, 30])),
            ],
        )
    }

    #[test]
    fn test_lower_cases_and_appends_provenance() {
        let table = normalize(trip_table(), "yellow_tripdata_2013-01.parquet", loaded_at()).unwrap();

        assert_eq!(
            column_names(&table),
            vec![
                "vendorid",
                "passenger_count",
                "trip_distance",
                "store_and_fwd_flag",
                "total_amount",
                "load_date",
                "source_file"
            ]
        );
        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.source_file(), "yellow_tripdata_2013-01.parquet");

        let batch = &table.batches()[0];
        let sources = batch.column(6).as_string::<i32>();
        assert!(sources
            .iter()
            .all(|s| s == Some("yellow_tripdata_2013-01.parquet")));
        let load_dates = batch
            .column(5)
            .as_primitive::<arrow::datatypes::TimestampMicrosecondType>();
        assert_eq!(
            load_dates.value(0),
            loaded_at().and_utc().timestamp_micros()
        );
    }

    #[test]
    fn test_coerces_to_canonical_types() {
        let table = normalize(trip_table(), "f.parquet", loaded_at()).unwrap();
        let schema = table.schema();

        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).data_type(), &DataType::Int64);
        assert_eq!(schema.field(2).data_type(), &DataType::Float64);
        assert_eq!(schema.field(3).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(4).data_type(), &DataType::Float64);

        let distance = table.batches()[0].column(2).as_primitive::<Float64Type>();
        assert_eq!(distance.value(0), 1.5);
        assert_eq!(distance.value(1), 0.25);
    }

    #[test]
    fn test_nullable_int_preserves_nulls() {
        let table = normalize(trip_table(), "f.parquet", loaded_at()).unwrap();
        let batch = &table.batches()[0];

        let vendor = batch.column(0).as_primitive::<Int64Type>();
        assert_eq!(vendor.value(0), 1);
        assert!(vendor.is_null(1));
        assert_eq!(vendor.value(2), 2);

        let passengers = batch.column(1).as_primitive::<Int64Type>();
        assert_eq!(passengers.value(0), 1);
        assert_eq!(passengers.value(1), 3);
        assert!(passengers.is_null(2));
    }

    #[test]
    fn test_flag_keeps_nulls_as_null() {
        let table = normalize(trip_table(), "f.parquet", loaded_at()).unwrap();
        let flags = table.batches()[0].column(3).as_string::<i32>();

        assert_eq!(flags.value(0), "N");
        assert!(flags.is_null(1));
        assert_eq!(flags.value(2), "Y");
    }

    #[test]
    fn test_missing_optional_columns_are_skipped() {
        let raw = raw_table(
            vec![
                Field::new("VendorID", DataType::Int64, true),
                Field::new("fare_amount", DataType::Int32, true),
            ],
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(Int32Array::from(vec![5, 7])),
            ],
        );

        let table = normalize(raw, "f.parquet", loaded_at()).unwrap();

        assert_eq!(
            column_names(&table),
            vec!["vendorid", "fare_amount", "load_date", "source_file"]
        );
        assert_eq!(table.schema().field(1).data_type(), &DataType::Float64);
    }

    #[test]
    fn test_normalization_is_idempotent_on_names() {
        let first = normalize(trip_table(), "f.parquet", loaded_at()).unwrap();
        let again = normalize(
            RawTable {
                schema: Arc::clone(first.schema()),
                batches: first.batches().to_vec(),
            },
            "f.parquet",
            loaded_at(),
        )
        .unwrap();

        assert_eq!(column_names(&first), column_names(&again));
        assert_eq!(first.schema(), again.schema());
        assert_eq!(first.batches(), again.batches());
    }

    #[test]
    fn test_fractional_identifier_is_rejected() {
        let raw = raw_table(
            vec![Field::new("RatecodeID", DataType::Float64, true)],
            vec![Arc::new(Float64Array::from(vec![Some(1.0), Some(2.5)]))],
        );

        let err = normalize(raw, "f.parquet", loaded_at()).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("ratecodeid"), "{}", message);
        assert!(message.contains("2.5"), "{}", message);
    }

    #[test]
    fn test_unloadable_column_type_is_rejected() {
        let raw = raw_table(
            vec![Field::new("Payload", DataType::Binary, true)],
            vec![Arc::new(BinaryArray::from(vec![Some(&b"\x00"[..]), None]))],
        );

        let err = normalize(raw, "f.parquet", loaded_at()).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("payload"), "{}", message);
        assert!(message.contains("Binary"), "{}", message);
    }

    #[test]
    fn test_non_finite_identifier_becomes_null() {
        let raw = raw_table(
            vec![Field::new("payment_type", DataType::Float64, true)],
            vec![Arc::new(Float64Array::from(vec![f64::NAN, 2.0]))],
        );

        let table = normalize(raw, "f.parquet", loaded_at()).unwrap();
        let payment = table.batches()[0].column(0).as_primitive::<Int64Type>();
        assert!(payment.is_null(0));
        assert_eq!(payment.value(1), 2);
    }

    #[test]
    fn test_colliding_names_are_rejected() {
        let raw = raw_table(
            vec![
                Field::new("Extra", DataType::Float64, true),
                Field::new("EXTRA", DataType::Float64, true),
            ],
            vec![
                Arc::new(Float64Array::from(vec![1.0])),
                Arc::new(Float64Array::from(vec![2.0])),
            ],
        );

        assert!(normalize(raw, "f.parquet", loaded_at()).is_err());
    }

    #[test]
    fn test_existing_provenance_columns_are_replaced() {
        let raw = raw_table(
            vec![
                Field::new("fare_amount", DataType::Float64, true),
                Field::new("Source_File", DataType::Utf8, true),
            ],
            vec![
                Arc::new(Float64Array::from(vec![1.0])),
                Arc::new(StringArray::from(vec!["stale.parquet"])),
            ],
        );

        let table = normalize(raw, "fresh.parquet", loaded_at()).unwrap();

        assert_eq!(
            column_names(&table),
            vec!["fare_amount", "load_date", "source_file"]
        );
        let sources = table.batches()[0].column(2).as_string::<i32>();
        assert_eq!(sources.value(0), "fresh.parquet");
    }

    #[test]
    fn test_empty_partition_keeps_schema() {
        let raw = RawTable {
            schema: Arc::new(Schema::new(vec![Field::new(
                "VendorID",
                DataType::Int32,
                true,
            )])),
            batches: Vec::new(),
        };

        let table = normalize(raw, "f.parquet", loaded_at()).unwrap();
        assert_eq!(table.num_rows(), 0);
        assert_eq!(table.schema().field(0).data_type(), &DataType::Int64);
    }
}
