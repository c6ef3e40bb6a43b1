//! Get command - Show one job record

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use tally_queue::{JobRecord, QueueConfig};

use super::open_queue;
use crate::print_warning;

/// Arguments for the get command
#[derive(Args)]
pub struct GetArgs {
    /// Job id
    id: String,

    /// Output raw JSON (no formatting)
    #[arg(long)]
    raw: bool,
}

/// Run the get command
pub async fn run(config: &QueueConfig, args: GetArgs) -> Result<()> {
    let queue = open_queue(config).await?;
    let job = queue.get_job(&args.id).await?;
    queue.close().await?;

    let Some(job) = job else {
        print_warning(&format!("Job '{}' not found in {}", args.id, config.queue_name));
        return Ok(());
    };

    if args.raw {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job(&job)?;
    }
    Ok(())
}

fn print_job(job: &JobRecord) -> Result<()> {
    println!("{} {}", "Job".bold(), job.id.green().bold());
    println!();
    println!("  {} {}", "Type:".dimmed(), job.job_type);
    println!("  {} {}", "Status:".dimmed(), job.status.to_string().cyan());
    println!("  {} {}", "Priority:".dimmed(), job.priority);
    println!("  {} {}/{}", "Attempts:".dimmed(), job.attempts, job.max_attempts);
    println!("  {} {}%", "Progress:".dimmed(), job.progress);
    println!("  {} {}", "Created:".dimmed(), job.created_at.to_rfc3339());
    println!("  {} {}", "Updated:".dimmed(), job.updated_at.to_rfc3339());
    if let Some(started) = job.processing_started_at {
        println!("  {} {}", "Started:".dimmed(), started.to_rfc3339());
    }
    if let Some(finished) = job.processing_completed_at {
        println!("  {} {}", "Finished:".dimmed(), finished.to_rfc3339());
    }
    if let Some(error) = &job.error {
        println!("  {} {}", "Error:".dimmed(), error.red());
    }

    println!();
    println!("{}", "Payload:".bold());
    println!("{}", serde_json::to_string_pretty(&job.payload)?);
    if let Some(result) = &job.result {
        println!();
        println!("{}", "Result:".bold());
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}
