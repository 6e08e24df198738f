use anyhow::{Result, anyhow};
use chrono::Local;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::error::PartitionError;
use super::loader::{TableSink, WriteMode};
use super::partition::{Partition, PartitionState, SourceLayout};
use crate::config::BATCH_SIZE;
use crate::formats::parquet::{normalize, read_parquet};
use crate::io::PartitionSource;
use crate::telemetry::TelemetryEvent;

/// What to do after a partition fails and more partitions remain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    /// Keep going with the next partition
    Continue,
    /// Stop the run
    Abort,
    /// Ask the [`Operator`]
    Prompt,
}

impl OnFailure {
    /// Parse policy from string (case-insensitive)
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "continue" => Ok(OnFailure::Continue),
            "abort" => Ok(OnFailure::Abort),
            "prompt" => Ok(OnFailure::Prompt),
            _ => Err(anyhow!(
                "Invalid failure policy: {}. Supported values: continue, abort, prompt",
                s
            )),
        }
    }
}

/// Decides whether a run continues past a failed partition
///
/// Called from a blocking thread, so implementations may wait on a terminal.
pub trait Operator: Send + Sync {
    fn confirm_continue(&self, partition: &Partition, error: &PartitionError) -> bool;

    /// Whether a setup sequence continues past a failed step
    fn confirm_next_step(&self, _step: &str, _error: &str) -> bool {
        false
    }
}

impl<F> Operator for F
where
    F: Fn(&Partition, &PartitionError) -> bool + Send + Sync,
{
    fn confirm_continue(&self, partition: &Partition, error: &PartitionError) -> bool {
        self(partition, error)
    }
}

/// Outcome of one partition within a run
#[derive(Debug, Clone)]
pub struct PartitionOutcome {
    pub partition: Partition,
    pub state: PartitionState,
    pub rows: u64,
    pub elapsed: Duration,
    pub error: Option<PartitionError>,
}

impl PartitionOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == PartitionState::Succeeded
    }
}

/// Aggregated result of a run
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Partitions the run was asked to load
    pub requested: usize,
    /// Partitions that were started (fewer than `requested` after an abort)
    pub attempted: usize,
    pub succeeded: usize,
    pub total_rows: u64,
    pub elapsed: Duration,
    pub outcomes: Vec<PartitionOutcome>,
    /// Batch write latency p50/p90/p99 in milliseconds
    pub batch_percentiles: (Option<u64>, Option<u64>, Option<u64>),
    /// Row count of the destination table after the run, when verified
    pub table_rows: Option<u64>,
}

impl RunSummary {
    fn new(requested: usize, outcomes: Vec<PartitionOutcome>, elapsed: Duration) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        let total_rows = outcomes
            .iter()
            .filter(|o| o.succeeded())
            .map(|o| o.rows)
            .sum();

        Self {
            requested,
            attempted: outcomes.len(),
            succeeded,
            total_rows,
            elapsed,
            outcomes,
            batch_percentiles: (None, None, None),
            table_rows: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.succeeded == self.requested
    }

    /// 0 if every requested partition succeeded, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn failures(&self) -> impl Iterator<Item = &PartitionOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }
}

/// Drives Fetch -> Normalize -> Load for each partition, strictly in order
pub struct Pipeline {
    source: Arc<dyn PartitionSource>,
    layout: SourceLayout,
    sink: Arc<dyn TableSink>,
    on_failure: OnFailure,
    operator: Option<Arc<dyn Operator>>,
    read_batch_size: usize,
    telemetry_tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
}

impl Pipeline {
    /// Create a pipeline that aborts on the first failure
    pub fn new(
        source: Arc<dyn PartitionSource>,
        layout: SourceLayout,
        sink: Arc<dyn TableSink>,
    ) -> Self {
        Self {
            source,
            layout,
            sink,
            on_failure: OnFailure::Abort,
            operator: None,
            read_batch_size: BATCH_SIZE,
            telemetry_tx: None,
        }
    }

    /// Set the failure policy; `operator` is consulted for [`OnFailure::Prompt`]
    pub fn with_failure_policy(
        mut self,
        on_failure: OnFailure,
        operator: Option<Arc<dyn Operator>>,
    ) -> Self {
        self.on_failure = on_failure;
        self.operator = operator;
        self
    }

    pub fn with_read_batch_size(mut self, read_batch_size: usize) -> Self {
        self.read_batch_size = read_batch_size.max(1);
        self
    }

    pub fn with_telemetry(mut self, telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>) -> Self {
        self.telemetry_tx = Some(telemetry_tx);
        self
    }

    /// Run every partition in order
    ///
    /// Partition failures never escape; they are recorded in the summary.
    pub async fn run(&self, partitions: &[Partition]) -> RunSummary {
        let start = Instant::now();
        let mut outcomes = Vec::with_capacity(partitions.len());

        info!(partitions = partitions.len(), "starting run");

        for (index, partition) in partitions.iter().enumerate() {
            let outcome = self
                .run_partition(*partition, WriteMode::for_index(index))
                .await;
            let failure = outcome.error.clone();
            outcomes.push(outcome);

            let Some(failure) = failure else {
                continue;
            };

            let remaining = partitions.len() - index - 1;
            if remaining == 0 {
                break;
            }
            if !self.should_continue(partition, &failure).await {
                warn!(
                    partition = %partition,
                    skipped = remaining,
                    "run aborted after failure"
                );
                break;
            }
        }

        let summary = RunSummary::new(partitions.len(), outcomes, start.elapsed());
        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            rows = summary.total_rows,
            elapsed_secs = %format!("{:.2}", summary.elapsed.as_secs_f64()),
            "run finished"
        );
        summary
    }

    async fn run_partition(&self, partition: Partition, mode: WriteMode) -> PartitionOutcome {
        let start = Instant::now();
        self.emit(TelemetryEvent::PartitionStarted { partition });

        match self.process(partition, mode).await {
            Ok(rows) => {
                info!(
                    partition = %partition,
                    rows,
                    elapsed_secs = %format!("{:.2}", start.elapsed().as_secs_f64()),
                    "partition loaded"
                );
                self.emit(TelemetryEvent::PartitionCompleted { partition, rows });
                PartitionOutcome {
                    partition,
                    state: PartitionState::Succeeded,
                    rows,
                    elapsed: start.elapsed(),
                    error: None,
                }
            }
            Err(e) => {
                error!(partition = %partition, kind = e.kind(), "{}", e);
                self.emit(TelemetryEvent::PartitionFailed { partition });
                PartitionOutcome {
                    partition,
                    state: PartitionState::Failed,
                    rows: 0,
                    elapsed: start.elapsed(),
                    error: Some(e),
                }
            }
        }
    }

    async fn process(&self, partition: Partition, mode: WriteMode) -> Result<u64, PartitionError> {
        let file_name = self.layout.file_name(&partition);

        self.transition(partition, PartitionState::Fetching);
        info!(partition = %partition, source = %self.source.locate(&file_name), "fetching");
        let blob = self
            .source
            .fetch(&file_name)
            .await
            .map_err(PartitionError::transfer)?;

        self.transition(partition, PartitionState::Normalizing);
        let raw = read_parquet(blob, self.read_batch_size).map_err(PartitionError::parse)?;
        let table = normalize(raw, &file_name, Local::now().naive_local())
            .map_err(PartitionError::parse)?;

        self.transition(partition, PartitionState::Loading);
        info!(partition = %partition, rows = table.num_rows(), mode = ?mode, "loading");
        self.sink
            .load(&table, mode)
            .await
            .map_err(PartitionError::load)
    }

    async fn should_continue(&self, partition: &Partition, failure: &PartitionError) -> bool {
        match self.on_failure {
            OnFailure::Continue => true,
            OnFailure::Abort => false,
            OnFailure::Prompt => {
                let Some(operator) = self.operator.clone() else {
                    warn!("no operator available to confirm, aborting");
                    return false;
                };
                let partition = *partition;
                let failure = failure.clone();
                tokio::task::spawn_blocking(move || operator.confirm_continue(&partition, &failure))
                    .await
                    .unwrap_or(false)
            }
        }
    }

    fn transition(&self, partition: Partition, state: PartitionState) {
        tracing::debug!(partition = %partition, state = %state, "state change");
        self.emit(TelemetryEvent::StateChanged { partition, state });
    }

    fn emit(&self, event: TelemetryEvent) {
        if let Some(tx) = &self.telemetry_tx {
            let _ = tx.send(event);
        }
    }
}
