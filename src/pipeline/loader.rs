use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::MAX_BIND_PARAMS;
use crate::db::schema::{self, Schema, SqlType, quote_ident};
use crate::db::{Pool, PoolTransaction};
use crate::formats::parquet::{NormalizedTable, record_batch_to_records};
use crate::formats::record::{Record, Value};
use crate::telemetry::TelemetryEvent;

/// How a partition is written to the destination table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Drop and recreate the table from the partition's schema, then insert
    Replace,
    /// Insert into the existing table, creating it if it is missing
    Append,
}

impl WriteMode {
    /// The first partition of a run bootstraps the table; every later one appends
    pub fn for_index(index: usize) -> Self {
        if index == 0 {
            WriteMode::Replace
        } else {
            WriteMode::Append
        }
    }
}

/// Destination for normalized partitions
#[async_trait]
pub trait TableSink: Send + Sync {
    /// Write every row of `table`, returning the number of rows written
    ///
    /// Either all rows land or none do.
    async fn load(&self, table: &NormalizedTable, mode: WriteMode) -> Result<u64>;
}

/// Writes partitions into one table with multi-row INSERTs
///
/// Each partition runs in its own transaction on a single pooled connection,
/// so a failure leaves the table as it was before the partition started.
pub struct BulkLoader {
    pool: Pool,
    schema_name: String,
    table_name: String,
    batch_size: usize,
    telemetry_tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
}

impl BulkLoader {
    pub fn new(
        pool: Pool,
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            pool,
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            batch_size: batch_size.max(1),
            telemetry_tx: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>) -> Self {
        self.telemetry_tx = Some(telemetry_tx);
        self
    }

    /// Quoted destination table reference
    pub fn table_spec(&self) -> String {
        self.pool
            .qualified_table_name(&self.schema_name, &self.table_name)
    }

    /// Rows per INSERT so that rows x columns stays within the bind limit
    fn rows_per_statement(&self, num_columns: usize) -> usize {
        (MAX_BIND_PARAMS / num_columns.max(1)).clamp(1, self.batch_size)
    }

    async fn prepare_table(
        &self,
        tx: &mut PoolTransaction<'_>,
        table_spec: &str,
        schema: &Schema,
        mode: WriteMode,
    ) -> Result<()> {
        match mode {
            WriteMode::Replace => {
                info!(table = table_spec, "replacing destination table");
                tx.execute(&schema::generate_drop_table(table_spec))
                    .await
                    .context("Failed to drop destination table")?;
                tx.execute(&schema::generate_create_table(table_spec, schema, false))
                    .await
                    .context("Failed to create destination table")?;
            }
            WriteMode::Append => {
                tx.execute(&schema::generate_create_table(table_spec, schema, true))
                    .await
                    .context("Failed to ensure destination table exists")?;
            }
        }
        Ok(())
    }

    fn send_batch_telemetry(&self, rows: u64, duration_ms: u64) {
        if let Some(tx) = &self.telemetry_tx {
            let _ = tx.send(TelemetryEvent::BatchLoaded { rows, duration_ms });
        }
    }
}

#[async_trait]
impl TableSink for BulkLoader {
    async fn load(&self, table: &NormalizedTable, mode: WriteMode) -> Result<u64> {
        let schema = Schema::from_arrow(table.schema())?;
        let column_types: Vec<SqlType> = schema.columns.iter().map(|c| c.sql_type).collect();
        let table_spec = self.table_spec();
        let rows_per_statement = self.rows_per_statement(schema.columns.len());

        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection from pool")?;
        let mut tx = conn
            .begin()
            .await
            .context("Failed to begin transaction")?;

        self.prepare_table(&mut tx, &table_spec, &schema, mode)
            .await?;

        let mut rows_loaded = 0u64;
        for batch in table.batches() {
            let mut offset = 0;
            while offset < batch.num_rows() {
                let len = self.batch_size.min(batch.num_rows() - offset);
                let start = Instant::now();

                let records = record_batch_to_records(&batch.slice(offset, len))?;
                for chunk in records.chunks(rows_per_statement) {
                    let insert_sql = build_insert_sql(&table_spec, &schema, chunk.len());
                    insert_records(&mut tx, &insert_sql, chunk, &column_types)
                        .await
                        .with_context(|| {
                            format!(
                                "Failed to insert rows {}..{} of {}",
                                rows_loaded,
                                rows_loaded + len as u64,
                                table.source_file()
                            )
                        })?;
                }

                let duration_ms = start.elapsed().as_millis() as u64;
                debug!(rows = len, duration_ms, "batch written");
                self.send_batch_telemetry(len as u64, duration_ms);

                rows_loaded += len as u64;
                offset += len;
            }
        }

        tx.commit().await.context("Failed to commit partition")?;

        Ok(rows_loaded)
    }
}

/// Build `INSERT INTO table (c1, c2) VALUES ($1, $2), ($3, $4), ...`
fn build_insert_sql(table_spec: &str, schema: &Schema, num_rows: usize) -> String {
    let num_columns = schema.columns.len();
    let column_list: Vec<String> = schema.columns.iter().map(|c| quote_ident(&c.name)).collect();

    let mut value_groups = Vec::with_capacity(num_rows);
    let mut param_idx = 1;
    for _ in 0..num_rows {
        let placeholders: Vec<String> = (0..num_columns)
            .map(|_| {
                let placeholder = format!("${}", param_idx);
                param_idx += 1;
                placeholder
            })
            .collect();
        value_groups.push(format!("({})", placeholders.join(", ")));
    }

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table_spec,
        column_list.join(", "),
        value_groups.join(", ")
    )
}

async fn insert_records(
    tx: &mut PoolTransaction<'_>,
    insert_sql: &str,
    records: &[Record],
    column_types: &[SqlType],
) -> Result<(), sqlx::Error> {
    match tx {
        PoolTransaction::Postgres(tx) => {
            let mut query = sqlx::query(insert_sql);
            for record in records {
                for (value, sql_type) in record.values.iter().zip(column_types) {
                    query = bind_pg(query, value, *sql_type);
                }
            }
            query.execute(&mut **tx).await?;
        }
        #[cfg(test)]
        PoolTransaction::Sqlite(tx) => {
            // Convert Postgres placeholders ($1, $2) to SQLite placeholders (?, ?)
            let sqlite_sql = convert_to_sqlite_placeholders(insert_sql);
            let mut query = sqlx::query(&sqlite_sql);
            for record in records {
                for (value, sql_type) in record.values.iter().zip(column_types) {
                    query = bind_sqlite(query, value, *sql_type);
                }
            }
            query.execute(&mut **tx).await?;
        }
    }
    Ok(())
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

/// Bind a single value, using a typed NULL for missing values
fn bind_pg<'q>(query: PgQuery<'q>, value: &'q Option<Value>, sql_type: SqlType) -> PgQuery<'q> {
    match value {
        None => match sql_type {
            SqlType::Boolean => query.bind(None::<bool>),
            SqlType::SmallInt => query.bind(None::<i16>),
            SqlType::Integer => query.bind(None::<i32>),
            SqlType::BigInt => query.bind(None::<i64>),
            SqlType::Real => query.bind(None::<f32>),
            SqlType::DoublePrecision => query.bind(None::<f64>),
            SqlType::Text => query.bind(None::<&str>),
            SqlType::Timestamp => query.bind(None::<chrono::NaiveDateTime>),
            SqlType::TimestampTz => query.bind(None::<chrono::DateTime<chrono::Utc>>),
            SqlType::Date => query.bind(None::<chrono::NaiveDate>),
        },
        Some(Value::Boolean(v)) => query.bind(*v),
        Some(Value::SmallInt(v)) => query.bind(*v),
        Some(Value::Integer(v)) => query.bind(*v),
        Some(Value::BigInt(v)) => query.bind(*v),
        Some(Value::Real(v)) => query.bind(*v),
        Some(Value::Double(v)) => query.bind(*v),
        Some(Value::Text(v)) => query.bind(v.as_str()),
        Some(Value::Timestamp(v)) => query.bind(*v),
        Some(Value::TimestampTz(v)) => query.bind(*v),
        Some(Value::Date(v)) => query.bind(*v),
    }
}

#[cfg(test)]
type SqliteQuery<'q> =
    sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

#[cfg(test)]
fn bind_sqlite<'q>(
    query: SqliteQuery<'q>,
    value: &'q Option<Value>,
    sql_type: SqlType,
) -> SqliteQuery<'q> {
    match value {
        None => match sql_type {
            SqlType::Boolean => query.bind(None::<bool>),
            SqlType::SmallInt | SqlType::Integer | SqlType::BigInt => query.bind(None::<i64>),
            SqlType::Real | SqlType::DoublePrecision => query.bind(None::<f64>),
            _ => query.bind(None::<&str>),
        },
        Some(Value::Boolean(v)) => query.bind(*v),
        Some(Value::SmallInt(v)) => query.bind(*v),
        Some(Value::Integer(v)) => query.bind(*v),
        Some(Value::BigInt(v)) => query.bind(*v),
        Some(Value::Real(v)) => query.bind(*v),
        Some(Value::Double(v)) => query.bind(*v),
        Some(Value::Text(v)) => query.bind(v.as_str()),
        Some(Value::Timestamp(v)) => query.bind(*v),
        Some(Value::TimestampTz(v)) => query.bind(*v),
        Some(Value::Date(v)) => query.bind(*v),
    }
}

/// Convert Postgres-style placeholders ($1, $2, ...) to SQLite-style (?, ?, ...)
#[cfg(test)]
fn convert_to_sqlite_placeholders(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            // Skip the dollar sign and any following digits
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                chars.next();
            }
            result.push('?');
        } else {
            result.push(ch);
        }
    }

    result
}
