use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Input, Select};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taxi_loader::runner::{
    DEFAULT_SCHEMA, DEFAULT_TABLE, DEFAULT_YEAR, Driver, LoadArgs, OnFailure, Operator, Partition,
    PartitionError, RunSummary, Selection, SetupArgs, SetupSummary, SourceConfig,
    WarehouseConfig, run_load, run_setup,
};
use tracing::error;

/// Exit status after an operator interrupt
const EXIT_INTERRUPTED: i32 = 130;

/// How long an interrupted run gets to release its connection
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Clone)]
#[command(about = "Load monthly NYC TLC trip-record files into PostgreSQL")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Download and load trip-record partitions
    Load {
        #[command(flatten)]
        load: LoadOptions,

        /// Load every month of the year
        #[arg(long, conflicts_with = "month")]
        all: bool,

        /// Load a single month (1-12)
        #[arg(short, long)]
        month: Option<u32>,
    },

    /// Create the database and table, load every month, then validate
    Setup {
        #[command(flatten)]
        load: LoadOptions,

        /// SQL script that creates the destination table
        #[arg(long)]
        create_sql: Option<PathBuf>,

        /// SQL script with validation queries, run after loading
        #[arg(long)]
        validate_sql: Option<PathBuf>,

        /// Do not create the target database when it is missing
        #[arg(long)]
        skip_create_database: bool,

        /// Start without asking for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Clone, clap::Args)]
struct LoadOptions {
    #[command(flatten)]
    connection: ConnectionOptions,

    /// Base URL or local directory holding the partition files
    #[arg(long, default_value = taxi_loader::runner::DEFAULT_BASE_URL)]
    source: String,

    /// Dataset prefix of the partition file names
    #[arg(long, default_value = taxi_loader::runner::DEFAULT_DATASET)]
    dataset: String,

    /// File extension of the partition files
    #[arg(long, default_value = taxi_loader::runner::DEFAULT_EXTENSION)]
    extension: String,

    /// Year to load
    #[arg(long, default_value_t = DEFAULT_YEAR)]
    year: i32,

    /// Destination schema
    #[arg(long, default_value = DEFAULT_SCHEMA)]
    schema: String,

    /// Destination table
    #[arg(short, long, default_value = DEFAULT_TABLE)]
    table: String,

    /// What to do after a failed partition (continue, abort, prompt)
    #[arg(long, default_value = "prompt")]
    on_failure: String,

    /// Rows per batch
    #[arg(short, long, default_value_t = taxi_loader::runner::BATCH_SIZE)]
    batch_size: usize,

    /// Quiet mode - minimal output, only show summary
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Clone, clap::Args)]
struct ConnectionOptions {
    /// Database host
    #[arg(long, env = "DBT_SERVER", default_value = "localhost")]
    server: String,

    /// Database port
    #[arg(long, env = "DBT_PORT", default_value_t = 5432)]
    port: u16,

    /// Database name
    #[arg(long, env = "DBT_DATABASE", default_value = "DataWarehouseTreinamento")]
    database: String,

    /// Database username
    #[arg(long, env = "DBT_USER", default_value = "postgres")]
    user: String,

    /// Database password
    #[arg(long, env = "DBT_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Database driver
    #[arg(long, env = "DBT_DRIVER", default_value = "postgres")]
    driver: String,
}

impl ConnectionOptions {
    fn to_config(&self) -> Result<WarehouseConfig> {
        Ok(WarehouseConfig {
            host: self.server.clone(),
            port: self.port,
            database: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            driver: Driver::parse(&self.driver)?,
        })
    }
}

impl LoadOptions {
    fn to_load_args(&self, selection: Selection) -> Result<LoadArgs> {
        let source = SourceConfig {
            base_url: self.source.clone(),
            dataset: self.dataset.clone(),
            extension: self.extension.clone(),
            year: self.year,
        };
        let mut args = LoadArgs::new(self.connection.to_config()?, source, selection);
        args.schema = self.schema.clone();
        args.table = self.table.clone();
        args.on_failure = OnFailure::parse(&self.on_failure)?;
        args.batch_size = self.batch_size;
        args.quiet = self.quiet;
        Ok(args)
    }
}

/// Asks the operator on the terminal
struct TerminalOperator;

impl Operator for TerminalOperator {
    fn confirm_continue(&self, partition: &Partition, error: &PartitionError) -> bool {
        Confirm::new()
            .with_prompt(format!(
                "Partition {} failed ({}). Continue with the next partition?",
                partition,
                error.kind()
            ))
            .default(false)
            .interact()
            .unwrap_or(false)
    }

    fn confirm_next_step(&self, step: &str, _error: &str) -> bool {
        Confirm::new()
            .with_prompt(format!("Step '{}' failed. Continue with the next step?", step))
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    match args.command {
        Command::Load { load, all, month } => {
            init_tracing(load.quiet);
            let selection = match cli::selection_from_flags(all, month) {
                Some(selection) => selection,
                None => match prompt_selection()? {
                    Some(selection) => selection,
                    None => {
                        println!("Cancelled.");
                        return Ok(0);
                    }
                },
            };
            if let Selection::Month(m) = selection
                && !cli::is_valid_month(m)
            {
                eprintln!("Invalid month '{}': expected 1-12", m);
                return Ok(1);
            }
            run_loader(load.to_load_args(selection)?).await
        }
        Command::Setup {
            load,
            create_sql,
            validate_sql,
            skip_create_database,
            yes,
        } => {
            init_tracing(load.quiet);
            let setup_args = SetupArgs {
                load: load.to_load_args(Selection::All)?,
                ensure_database: !skip_create_database,
                create_script: create_sql,
                validate_script: validate_sql,
            };
            run_sequencer(setup_args, yes).await
        }
    }
}

fn init_tracing(quiet: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let default_filter = if quiet {
        "taxi_loader=warn,sqlx=off"
    } else {
        "taxi_loader=info,sqlx=off"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Interactive menu; `None` means the operator cancelled
fn prompt_selection() -> Result<Option<Selection>> {
    let choice = Select::new()
        .with_prompt("What do you want to load?")
        .items(&["All partitions", "One partition", "Cancel"])
        .default(0)
        .interact()
        .context("Failed to read menu choice")?;

    match choice {
        0 => Ok(Some(Selection::All)),
        1 => {
            let input: String = Input::new()
                .with_prompt("Month (1-12)")
                .interact_text()
                .context("Failed to read month")?;
            // An unparsable month is passed on as 0 and rejected by the caller
            Ok(Some(Selection::Month(cli::parse_month(&input).unwrap_or(0))))
        }
        _ => Ok(None),
    }
}

async fn run_loader(args: LoadArgs) -> Result<i32> {
    if !args.quiet {
        println!("Trip Data Loader");
        println!("================");
        println!("Warehouse: {}", args.warehouse.connection_string());
        println!("Source: {}", args.source.base_url);
        println!("Table: {}.{}", args.schema, args.table);
        println!("Partitions: {}", cli::describe_selection(&args.selection, args.source.year));
        println!();
    }

    let operator: Arc<dyn Operator> = Arc::new(TerminalOperator);
    let Some(summary) = run_interruptible(run_load(args, Some(operator))).await? else {
        return Ok(EXIT_INTERRUPTED);
    };

    print_run_summary(&summary);
    Ok(summary.exit_code())
}

async fn run_sequencer(args: SetupArgs, yes: bool) -> Result<i32> {
    println!("Trip Data Warehouse Setup");
    println!("=========================");
    println!("Warehouse: {}", args.load.warehouse.connection_string());
    println!("Source: {}", args.load.source.base_url);
    if let Some(path) = &args.create_script {
        println!("Create script: {}", path.display());
    }
    if let Some(path) = &args.validate_script {
        println!("Validate script: {}", path.display());
    }
    println!();

    if !yes {
        let start = Confirm::new()
            .with_prompt("Start the setup?")
            .default(false)
            .interact()
            .unwrap_or(false);
        if !start {
            println!("Cancelled.");
            return Ok(0);
        }
    }

    let operator: Arc<dyn Operator> = Arc::new(TerminalOperator);
    let Some(summary) = run_interruptible(run_setup(args, Some(operator))).await? else {
        return Ok(EXIT_INTERRUPTED);
    };

    print_setup_summary(&summary);
    Ok(summary.exit_code())
}

/// Run `task` until it finishes or the operator presses Ctrl-C
///
/// Returns `None` on interrupt. The task is aborted, which drops its open
/// transaction and returns its connection.
async fn run_interruptible<T, F>(task: F) -> Result<Option<T>>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let mut handle = tokio::spawn(task);

    tokio::select! {
        joined = &mut handle => {
            let result = joined.context("Run task failed")?;
            result.map(Some)
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for interrupt: {}", e);
            }
            eprintln!();
            eprintln!("Interrupted, aborting run...");
            handle.abort();
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
            Ok(None)
        }
    }
}

fn print_run_summary(summary: &RunSummary) {
    println!();
    println!("Load Summary");
    println!("============");
    for outcome in &summary.outcomes {
        match &outcome.error {
            None => println!(
                "  {}  {:<9} {:>12} rows  {:.2}s",
                outcome.partition,
                outcome.state,
                outcome.rows,
                outcome.elapsed.as_secs_f64()
            ),
            Some(error) => println!(
                "  {}  {:<9} {}",
                outcome.partition, outcome.state, error
            ),
        }
    }
    println!(
        "Partitions: {} requested, {} attempted, {} succeeded",
        summary.requested, summary.attempted, summary.succeeded
    );
    println!("Rows loaded: {}", summary.total_rows);
    if let Some(table_rows) = summary.table_rows {
        println!("Rows in table: {}", table_rows);
    }
    println!("Duration: {:.2}s", summary.elapsed.as_secs_f64());
    if summary.elapsed.as_secs_f64() > 0.0 {
        println!(
            "Throughput: {:.2} rows/sec",
            summary.total_rows as f64 / summary.elapsed.as_secs_f64()
        );
    }
    if let (Some(p50), Some(p90), Some(p99)) = summary.batch_percentiles {
        println!("Batch time: p50 {}ms, p90 {}ms, p99 {}ms", p50, p90, p99);
    }
}

fn print_setup_summary(summary: &SetupSummary) {
    if let Some(load) = &summary.load {
        print_run_summary(load);
    }
    println!();
    println!("Setup Summary");
    println!("=============");
    for step in &summary.steps {
        match &step.error {
            None => println!("  ok      {} ({:.2}s)", step.name, step.elapsed.as_secs_f64()),
            Some(error) => println!("  failed  {}: {}", step.name, error),
        }
    }
    let skipped = summary.planned - summary.steps.len();
    if skipped > 0 {
        println!("  {} step(s) not run", skipped);
    }
    println!("Duration: {:.2}s", summary.elapsed.as_secs_f64());
}

/// CLI utility functions for turning flags and prompt input into a selection
mod cli {
    use taxi_loader::runner::Selection;

    pub fn selection_from_flags(all: bool, month: Option<u32>) -> Option<Selection> {
        match (all, month) {
            (true, _) => Some(Selection::All),
            (false, Some(m)) => Some(Selection::Month(m)),
            (false, None) => None,
        }
    }

    pub fn is_valid_month(month: u32) -> bool {
        (1..=12).contains(&month)
    }

    /// Parse a month typed by the operator
    pub fn parse_month(input: &str) -> Option<u32> {
        input
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|m| is_valid_month(*m))
    }

    pub fn describe_selection(selection: &Selection, year: i32) -> String {
        match selection {
            Selection::All => format!("{}-01 through {}-12", year, year),
            Selection::Month(m) => format!("{}-{:02}", year, m),
        }
    }

}
