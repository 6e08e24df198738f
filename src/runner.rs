//! High-level runner API for the trip-record loader.
//!
//! This module provides a simplified public interface that encapsulates the
//! setup of connection pools, sources, the loader and the pipeline.
//!
//! This is the primary API for external users and for the CLI.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{self, Pool, PoolArgsBuilder};
use crate::io::{SourceLocation, open_source};
use crate::pipeline::{BulkLoader, Pipeline, SourceLayout};
use crate::telemetry::{TelemetryEvent, spawn_progress_tracking};

pub use crate::config::{
    BATCH_SIZE, DEFAULT_BASE_URL, DEFAULT_DATASET, DEFAULT_EXTENSION, DEFAULT_SCHEMA,
    DEFAULT_TABLE, DEFAULT_YEAR, Driver, SourceConfig, WarehouseConfig,
};
pub use crate::pipeline::{
    OnFailure, Operator, Partition, PartitionError, PartitionOutcome, PartitionState, RunSummary,
    Selection,
};

/// Arguments for running a load
#[derive(Debug, Clone)]
pub struct LoadArgs {
    // Connection configuration
    pub warehouse: WarehouseConfig,

    // Source configuration
    pub source: SourceConfig,
    pub selection: Selection,

    // Destination
    pub schema: String,
    pub table: String,

    // Options
    pub on_failure: OnFailure,
    pub batch_size: usize,
    pub quiet: bool,

    // Test-only: inject a pre-created pool (for SQLite testing)
    #[cfg(test)]
    pub test_pool: Option<Pool>,
}

impl LoadArgs {
    /// Arguments with the default destination table and batch size
    pub fn new(warehouse: WarehouseConfig, source: SourceConfig, selection: Selection) -> Self {
        Self {
            warehouse,
            source,
            selection,
            schema: DEFAULT_SCHEMA.to_string(),
            table: DEFAULT_TABLE.to_string(),
            on_failure: OnFailure::Prompt,
            batch_size: BATCH_SIZE,
            quiet: false,
            #[cfg(test)]
            test_pool: None,
        }
    }
}

fn open_pool(args: &LoadArgs) -> Result<Pool> {
    #[cfg(test)]
    if let Some(test_pool) = &args.test_pool {
        return Ok(test_pool.clone());
    }

    info!(
        connection = %args.warehouse.connection_string(),
        "configuring warehouse connection"
    );
    let pool_args = PoolArgsBuilder::default()
        .connect_options(args.warehouse.connect_options())
        .build()?;
    Ok(db::pool(pool_args))
}

/// Load the selected partitions
///
/// `operator` is consulted after a failed partition when the policy is
/// [`OnFailure::Prompt`]; without one, a prompt aborts the run.
///
/// # Example
///
/// ```no_run
/// use taxi_loader::runner::{
///     LoadArgs, OnFailure, Selection, SourceConfig, WarehouseConfig, run_load,
/// };
///
/// # async fn example() -> anyhow::Result<()> {
/// let mut args = LoadArgs::new(
///     WarehouseConfig::default(),
///     SourceConfig::default(),
///     Selection::Month(1),
/// );
/// args.on_failure = OnFailure::Abort;
///
/// let summary = run_load(args, None).await?;
/// println!("Loaded {} rows in {:?}", summary.total_rows, summary.elapsed);
/// # Ok(())
/// # }
/// ```
pub async fn run_load(args: LoadArgs, operator: Option<Arc<dyn Operator>>) -> Result<RunSummary> {
    let pool = open_pool(&args)?;
    load_with_pool(pool, args, operator).await
}

async fn load_with_pool(
    pool: Pool,
    args: LoadArgs,
    operator: Option<Arc<dyn Operator>>,
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let partitions = args.selection.partitions(args.source.year)?;
    let location = SourceLocation::parse(&args.source.base_url)?;
    let source = open_source(&location)?;
    let layout = SourceLayout::new(&args.source.dataset, &args.source.extension);

    info!(
        %run_id,
        partitions = partitions.len(),
        source = %args.source.base_url,
        table = %format!("{}.{}", args.schema, args.table),
        "starting load"
    );

    // Telemetry channel; the tracker ends once the pipeline and loader are dropped
    let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
    let tracker = spawn_progress_tracking(partitions.len(), args.quiet, telemetry_rx);

    let loader = BulkLoader::new(pool.clone(), &args.schema, &args.table, args.batch_size)
        .with_telemetry(telemetry_tx.clone());
    let table_spec = loader.table_spec();

    let pipeline = Pipeline::new(source, layout, Arc::new(loader))
        .with_failure_policy(args.on_failure, operator)
        .with_read_batch_size(args.batch_size)
        .with_telemetry(telemetry_tx);

    let mut summary = pipeline.run(&partitions).await;
    drop(pipeline);

    match tracker.await {
        Ok(stats) => summary.batch_percentiles = stats.get_percentiles(),
        Err(e) => warn!("Progress tracking task failed: {}", e),
    }

    if summary.succeeded > 0 {
        summary.table_rows = verify_row_count(&pool, &table_spec, summary.total_rows).await;
    }

    Ok(summary)
}

/// Compare the destination row count with the rows the run committed
async fn verify_row_count(pool: &Pool, table_spec: &str, expected: u64) -> Option<u64> {
    match pool.count_rows(table_spec).await {
        Ok(actual) => {
            if actual == expected {
                info!(table = table_spec, rows = actual, "row count verified");
            } else {
                warn!(
                    table = table_spec,
                    expected,
                    actual,
                    "destination row count does not match rows loaded by this run"
                );
            }
            Some(actual)
        }
        Err(e) => {
            warn!(table = table_spec, "Failed to verify row count: {}", e);
            None
        }
    }
}

/// Arguments for the full setup sequence
#[derive(Debug, Clone)]
pub struct SetupArgs {
    pub load: LoadArgs,
    /// Create the target database when it is missing
    pub ensure_database: bool,
    /// Script run before loading (table creation)
    pub create_script: Option<PathBuf>,
    /// Script run after loading (validation queries)
    pub validate_script: Option<PathBuf>,
}

/// Outcome of one setup step
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub name: &'static str,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// Result of the setup sequence
#[derive(Debug)]
pub struct SetupSummary {
    /// Steps the sequence planned to run
    pub planned: usize,
    /// Steps that ran, in order
    pub steps: Vec<StepOutcome>,
    /// Summary of the load step, if it ran
    pub load: Option<RunSummary>,
    pub elapsed: Duration,
}

impl SetupSummary {
    pub fn is_success(&self) -> bool {
        self.steps.len() == self.planned && self.steps.iter().all(|s| s.error.is_none())
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}

enum Step {
    EnsureDatabase,
    Script(&'static str, PathBuf),
    Load,
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::EnsureDatabase => "ensure database",
            Step::Script(name, _) => name,
            Step::Load => "load partitions",
        }
    }
}

/// Run the setup sequence: database, table script, load, validation script
///
/// A failed step asks `operator` whether to run the remaining steps, except
/// when the database itself could not be reached or created.
pub async fn run_setup(args: SetupArgs, operator: Option<Arc<dyn Operator>>) -> Result<SetupSummary> {
    let start = Instant::now();

    let mut steps = Vec::new();
    if args.ensure_database {
        steps.push(Step::EnsureDatabase);
    }
    if let Some(path) = args.create_script.clone() {
        steps.push(Step::Script("create table", path));
    }
    steps.push(Step::Load);
    if let Some(path) = args.validate_script.clone() {
        steps.push(Step::Script("validate data", path));
    }

    let pool = open_pool(&args.load)?;
    let planned = steps.len();
    let mut outcomes = Vec::with_capacity(planned);
    let mut load_summary = None;

    for (index, step) in steps.into_iter().enumerate() {
        let name = step.name();
        let stops_sequence = matches!(step, Step::EnsureDatabase);
        let step_start = Instant::now();
        info!(step = name, "starting setup step");

        let (result, summary) =
            run_step(step, pool.clone(), args.load.clone(), operator.clone()).await;
        if summary.is_some() {
            load_summary = summary;
        }

        let error = result.err().map(|e| format!("{:#}", e));
        let failed = error.clone();
        outcomes.push(StepOutcome {
            name,
            elapsed: step_start.elapsed(),
            error,
        });

        let Some(message) = failed else {
            info!(step = name, "setup step completed");
            continue;
        };

        error!(step = name, "{}", message);
        if stops_sequence || index + 1 == planned {
            break;
        }

        let confirmed = match operator.clone() {
            Some(operator) => tokio::task::spawn_blocking(move || {
                operator.confirm_next_step(name, &message)
            })
            .await
            .unwrap_or(false),
            None => false,
        };
        if !confirmed {
            warn!(step = name, "setup stopped after failed step");
            break;
        }
    }

    Ok(SetupSummary {
        planned,
        steps: outcomes,
        load: load_summary,
        elapsed: start.elapsed(),
    })
}

/// Run one setup step; the load step also returns its run summary
async fn run_step(
    step: Step,
    pool: Pool,
    load: LoadArgs,
    operator: Option<Arc<dyn Operator>>,
) -> (Result<()>, Option<RunSummary>) {
    match step {
        Step::EnsureDatabase => (
            db::setup::ensure_database_exists(load.warehouse)
                .await
                .map(|_| ()),
            None,
        ),
        Step::Script(_, path) => (db::setup::run_script(pool, path).await, None),
        Step::Load => match load_with_pool(pool, load, operator).await {
            Ok(summary) if summary.is_success() => (Ok(()), Some(summary)),
            Ok(summary) => {
                let failed = summary.requested - summary.succeeded;
                (
                    Err(anyhow::anyhow!("{} partition(s) did not load", failed)),
                    Some(summary),
                )
            }
            Err(e) => (Err(e.context("Load step failed")), None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    fn setup_args() -> SetupArgs {
        SetupArgs {
            load: LoadArgs::new(
                WarehouseConfig::default(),
                SourceConfig::default(),
                Selection::Month(1),
            ),
            ensure_database: true,
            create_script: Some(PathBuf::from("create.sql")),
            validate_script: Some(PathBuf::from("validate.sql")),
        }
    }

    #[test]
    fn test_run_futures_are_send() {
        let setup = run_setup(setup_args(), None);
        assert_send(&setup);

        let load = run_load(setup_args().load, None);
        assert_send(&load);
    }

    #[test]
    fn test_setup_summary_requires_every_planned_step() {
        let step = |error: Option<&str>| StepOutcome {
            name: "load partitions",
            elapsed: Duration::ZERO,
            error: error.map(str::to_string),
        };
        let summary = |steps: Vec<StepOutcome>| SetupSummary {
            planned: 2,
            steps,
            load: None,
            elapsed: Duration::ZERO,
        };

        assert_eq!(summary(vec![step(None), step(None)]).exit_code(), 0);
        assert_eq!(summary(vec![step(None)]).exit_code(), 1);
        assert_eq!(summary(vec![step(Some("boom")), step(None)]).exit_code(), 1);
    }
}
