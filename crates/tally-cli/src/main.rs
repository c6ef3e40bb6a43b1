//! Tally CLI - Command-line interface for the survey job queue
//!
//! # Usage
//!
//! ```bash
//! # Enqueue a job
//! tally enqueue send_survey_batch '{"surveyId": "nps", "phoneNumbers": ["+15550001"]}'
//!
//! # Inspect the queue
//! tally stats
//! tally list failed
//! tally get <job-id>
//!
//! # Prune terminal jobs older than a day
//! tally clean
//!
//! # Run a worker process
//! tally worker --concurrency 5
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;

use commands::{clean, enqueue, get, list, stats, worker, StoreArgs};

/// Tally - durable priority job queue
#[derive(Parser)]
#[command(
    name = "tally",
    version,
    about = "Tally CLI - Survey job queue administration",
    long_about = "Tally enqueues, inspects and processes background jobs.\n\n\
                  Producers and workers share one store (SQLite or Redis);\n\
                  the store is the single source of truth."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a job to the queue
    #[command(name = "enqueue")]
    Enqueue(enqueue::EnqueueArgs),

    /// Show one job record
    #[command(name = "get")]
    Get(get::GetArgs),

    /// List jobs by status
    #[command(name = "list")]
    List(list::ListArgs),

    /// Show per-status job counts
    #[command(name = "stats")]
    Stats(stats::StatsArgs),

    /// Delete old completed and failed jobs
    #[command(name = "clean")]
    Clean(clean::CleanArgs),

    /// Run a worker pool until interrupted
    #[command(name = "worker")]
    Worker(worker::WorkerArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing based on verbosity; workers log lifecycle events at info
    let verbosity = match cli.command {
        Commands::Worker(_) => cli.verbose.max(1),
        _ => cli.verbose,
    };
    setup_logging(verbosity);

    let config = cli.store.resolve()?;

    match cli.command {
        Commands::Enqueue(args) => enqueue::run(&config, args).await,
        Commands::Get(args) => get::run(&config, args).await,
        Commands::List(args) => list::run(&config, args).await,
        Commands::Stats(args) => stats::run(&config, args).await,
        Commands::Clean(args) => clean::run(&config, args).await,
        Commands::Worker(args) => worker::run(config, args).await,
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

/// Print an info message
pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}
