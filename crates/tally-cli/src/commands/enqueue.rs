//! Enqueue command - Add a job to the queue
//!
//! Usage:
//! ```bash
//! tally enqueue process_manual_numbers '{"surveyId": "csat", "phoneNumbers": ["+15550001"]}'
//! tally enqueue echo '{"ping": true}' --priority 10 --delay-ms 5000
//! ```

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::time::Duration;

use tally_queue::{BackoffStrategy, JobKind, JobOptions, QueueConfig};

use super::open_queue;
use crate::print_success;

/// Arguments for the enqueue command
#[derive(Args)]
pub struct EnqueueArgs {
    /// Job type tag
    job_type: String,

    /// JSON payload
    #[arg(default_value = "{}")]
    payload: String,

    /// Priority (higher runs first)
    #[arg(long)]
    priority: Option<i32>,

    /// Delay before the first run, in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Total attempts before the job fails permanently
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Retry with a fixed delay (milliseconds) instead of exponential backoff
    #[arg(long)]
    fixed_backoff_ms: Option<u64>,
}

/// Run the enqueue command
pub async fn run(config: &QueueConfig, args: EnqueueArgs) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&args.payload)
        .with_context(|| format!("Invalid JSON: {}", args.payload))?;

    let mut options = JobOptions::new();
    if let Some(priority) = args.priority {
        options = options.with_priority(priority);
    }
    if let Some(delay_ms) = args.delay_ms {
        options = options.with_delay(Duration::from_millis(delay_ms));
    }
    if let Some(max_attempts) = args.max_attempts {
        options = options.with_max_attempts(max_attempts);
    }
    if let Some(delay_ms) = args.fixed_backoff_ms {
        options = options.with_backoff(BackoffStrategy::Fixed { delay_ms });
    }
    if let Some(kind) = JobKind::from_type(&args.job_type) {
        options = options.or_defaults(kind.default_options());
    }

    let queue = open_queue(config).await?;
    let id = queue
        .enqueue(&args.job_type, payload, options)
        .await
        .with_context(|| format!("Failed to enqueue '{}'", args.job_type))?;
    queue.close().await?;

    print_success(&format!("Enqueued {} on {}", id.green(), config.queue_name.cyan()));
    Ok(())
}
