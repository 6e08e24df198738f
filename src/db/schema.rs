use anyhow::{Result, bail};
use arrow::datatypes::{DataType, Schema as ArrowSchema, TimeUnit};

/// SQL data type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Real,
    DoublePrecision,
    Text,
    Timestamp,
    TimestampTz,
    Date,
}

impl SqlType {
    /// Returns the Postgres type name
    pub fn to_postgres(&self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Real => "REAL",
            SqlType::DoublePrecision => "DOUBLE PRECISION",
            SqlType::Text => "TEXT",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::TimestampTz => "TIMESTAMP WITH TIME ZONE",
            SqlType::Date => "DATE",
        }
    }

    /// Map an Arrow column type to the SQL type it is stored as
    ///
    /// Unsigned types widen to the next signed type that holds every value.
    /// Decimals are stored as DOUBLE PRECISION.
    pub fn from_arrow(data_type: &DataType) -> Result<Self> {
        Ok(match data_type {
            DataType::Boolean => SqlType::Boolean,
            DataType::Int8 | DataType::Int16 | DataType::UInt8 => SqlType::SmallInt,
            DataType::Int32 | DataType::UInt16 => SqlType::Integer,
            DataType::Int64 | DataType::UInt32 | DataType::UInt64 => SqlType::BigInt,
            DataType::Float16 | DataType::Float32 => SqlType::Real,
            DataType::Float64
            | DataType::Decimal128(_, _)
            | DataType::Decimal256(_, _) => SqlType::DoublePrecision,
            DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => SqlType::Text,
            DataType::Dictionary(_, value_type) => Self::from_arrow(value_type)?,
            DataType::Timestamp(_, None) => SqlType::Timestamp,
            DataType::Timestamp(_, Some(_)) => SqlType::TimestampTz,
            DataType::Date32 | DataType::Date64 => SqlType::Date,
            other => bail!("Unsupported column type {:?}", other),
        })
    }

    /// The Arrow type values are cast to before binding
    pub fn arrow_type(&self) -> DataType {
        match self {
            SqlType::Boolean => DataType::Boolean,
            SqlType::SmallInt => DataType::Int16,
            SqlType::Integer => DataType::Int32,
            SqlType::BigInt => DataType::Int64,
            SqlType::Real => DataType::Float32,
            SqlType::DoublePrecision => DataType::Float64,
            SqlType::Text => DataType::Utf8,
            SqlType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
            SqlType::TimestampTz => {
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
            }
            SqlType::Date => DataType::Date32,
        }
    }
}

/// A column in a schema
///
/// Every column is created nullable; missing values in the source are
/// loaded as NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub sql_type: SqlType,
}

/// A destination table schema (collection of columns)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    /// Derive the destination schema from a normalized Arrow schema
    pub fn from_arrow(schema: &ArrowSchema) -> Result<Self> {
        let columns = schema
            .fields()
            .iter()
            .map(|field| {
                Ok(Column {
                    name: field.name().clone(),
                    sql_type: SqlType::from_arrow(field.data_type()).map_err(|e| {
                        anyhow::anyhow!("Column '{}': {}", field.name(), e)
                    })?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Schema { columns })
    }

    #[cfg(test)]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Quote an identifier for use in SQL, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Generate DDL statement for creating a table
///
/// `table_spec` must already be quoted (see `Pool::qualified_table_name`).
pub fn generate_create_table(table_spec: &str, schema: &Schema, if_not_exists: bool) -> String {
    let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
    let mut ddl = format!("CREATE TABLE {}{} (\n", guard, table_spec);

    let column_defs: Vec<String> = schema
        .columns
        .iter()
        .map(|col| format!("  {} {}", quote_ident(&col.name), col.sql_type.to_postgres()))
        .collect();

    ddl.push_str(&column_defs.join(",\n"));
    ddl.push_str("\n)");

    ddl
}

pub fn generate_drop_table(table_spec: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", table_spec)
}
