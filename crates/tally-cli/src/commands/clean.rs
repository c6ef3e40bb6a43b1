//! Clean command - Prune old terminal jobs

use anyhow::Result;
use clap::Args;
use std::time::Duration;

use tally_queue::manager::DEFAULT_CLEANUP_AGE;
use tally_queue::{JobManager, QueueConfig};

use super::open_queue;
use crate::print_success;

/// Arguments for the clean command
#[derive(Args)]
pub struct CleanArgs {
    /// Minimum age of removed jobs, in seconds
    #[arg(long, default_value_t = DEFAULT_CLEANUP_AGE.as_secs())]
    max_age_secs: u64,
}

/// Run the clean command
pub async fn run(config: &QueueConfig, args: CleanArgs) -> Result<()> {
    let queue = open_queue(config).await?;
    let manager = JobManager::new(queue.clone());
    let report = manager
        .clean_old_jobs(Duration::from_secs(args.max_age_secs))
        .await?;
    queue.close().await?;

    print_success(&format!(
        "Removed {} completed and {} failed job(s) older than {}s",
        report.completed, report.failed, args.max_age_secs
    ));
    Ok(())
}
