use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use crate::pipeline::partition::{Partition, PartitionState};

/// Telemetry events sent from the pipeline and loader for progress tracking
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// The pipeline started working on a partition
    PartitionStarted { partition: Partition },
    /// A partition moved to a new stage
    StateChanged {
        partition: Partition,
        state: PartitionState,
    },
    /// Batch of rows was written inside the partition's transaction
    BatchLoaded { rows: u64, duration_ms: u64 },
    /// Partition committed
    PartitionCompleted { partition: Partition, rows: u64 },
    /// Partition failed; its rows were rolled back
    PartitionFailed { partition: Partition },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub partitions_started: usize,
    pub partitions_succeeded: usize,
    pub partitions_failed: usize,
    /// Rows committed by succeeded partitions
    pub rows_committed: u64,
    /// Rows written so far, including batches later rolled back
    pub rows_written: u64,
    pub batch_durations_ms: Vec<u64>,
    pub current: Option<(Partition, PartitionState)>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::PartitionStarted { partition } => {
                self.partitions_started += 1;
                self.current = Some((*partition, PartitionState::Pending));
            }
            TelemetryEvent::StateChanged { partition, state } => {
                self.current = Some((*partition, *state));
            }
            TelemetryEvent::BatchLoaded { rows, duration_ms } => {
                self.rows_written += rows;
                self.batch_durations_ms.push(*duration_ms);
            }
            TelemetryEvent::PartitionCompleted { partition, rows } => {
                self.partitions_succeeded += 1;
                self.rows_committed += rows;
                self.current = Some((*partition, PartitionState::Succeeded));
            }
            TelemetryEvent::PartitionFailed { partition } => {
                self.partitions_failed += 1;
                self.current = Some((*partition, PartitionState::Failed));
            }
        }
    }

    /// Calculate percentile from batch durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.batch_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.batch_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = index.saturating_sub(1).min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// Spawn the task that folds telemetry into [`ProgressStats`]
///
/// Progress bars are drawn unless `quiet`. The task ends, returning the final
/// stats, once every sender has been dropped.
pub fn spawn_progress_tracking(
    total_partitions: usize,
    quiet: bool,
    mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
) -> tokio::task::JoinHandle<ProgressStats> {
    tokio::spawn(async move {
        let mut stats = ProgressStats::new();

        if quiet {
            while let Some(event) = telemetry_rx.recv().await {
                stats.update(&event);
            }
            return stats;
        }

        let multi_progress = MultiProgress::new();

        let partition_bar = multi_progress.add(ProgressBar::new(total_partitions as u64));
        partition_bar.set_style(bar_style(
            "[{elapsed_precise}] Partitions: [{bar:30.cyan/blue}] {pos}/{len} {msg}",
        ));

        let rows_bar = multi_progress.add(ProgressBar::no_length());
        rows_bar.set_style(bar_style(
            "[{elapsed_precise}] Rows:       {human_pos} | {per_sec}",
        ));

        let stats_bar = multi_progress.add(ProgressBar::new(0));
        stats_bar.set_style(bar_style("[{elapsed_precise}] Batch Time: {msg}"));

        while let Some(event) = telemetry_rx.recv().await {
            stats.update(&event);

            partition_bar
                .set_position((stats.partitions_succeeded + stats.partitions_failed) as u64);
            if let Some((partition, state)) = stats.current {
                partition_bar.set_message(format!("{} {}", partition, state));
            }
            rows_bar.set_position(stats.rows_written);

            let (p50, p90, p99) = stats.get_percentiles();
            if let (Some(p50), Some(p90), Some(p99)) = (p50, p90, p99) {
                stats_bar.set_message(format!("p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
            }
        }

        partition_bar.finish_with_message(format!(
            "{} succeeded, {} failed",
            stats.partitions_succeeded, stats.partitions_failed
        ));
        rows_bar.finish();
        stats_bar.finish();

        stats
    })
}
