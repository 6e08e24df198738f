use anyhow::{Result, bail};
use std::fmt;

/// One calendar month of trip records - the unit of fetch and load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Partition {
    year: i32,
    month: u32,
}

impl Partition {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            bail!("Invalid month {}. Use 1-12.", month);
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

/// Which partitions of a year a run should load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// January through December
    All,
    /// A single month (1-12)
    Month(u32),
}

impl Selection {
    /// Enumerate the partitions for `year` in load order
    pub fn partitions(&self, year: i32) -> Result<Vec<Partition>> {
        match self {
            Selection::All => (1..=12).map(|month| Partition::new(year, month)).collect(),
            Selection::Month(month) => Ok(vec![Partition::new(year, *month)?]),
        }
    }
}

/// Naming scheme of the source files: `{dataset}_{year}-{month:02}.{extension}`
#[derive(Debug, Clone)]
pub struct SourceLayout {
    pub dataset: String,
    pub extension: String,
}

impl SourceLayout {
    pub fn new(dataset: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            extension: extension.into(),
        }
    }

    pub fn file_name(&self, partition: &Partition) -> String {
        format!(
            "{}_{}-{:02}.{}",
            self.dataset,
            partition.year(),
            partition.month(),
            self.extension
        )
    }
}

/// Lifecycle of a partition within a run
///
/// `Pending -> Fetching -> Normalizing -> Loading -> {Succeeded | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Pending,
    Fetching,
    Normalizing,
    Loading,
    Succeeded,
    Failed,
}

impl PartitionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PartitionState::Succeeded | PartitionState::Failed)
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Pending => "pending",
            PartitionState::Fetching => "fetching",
            PartitionState::Normalizing => "normalizing",
            PartitionState::Loading => "loading",
            PartitionState::Succeeded => "succeeded",
            PartitionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
