//! List command - Show jobs of one status
//!
//! Usage:
//! ```bash
//! tally list waiting
//! tally list failed --start 0 --end -1
//! ```

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

use tally_queue::manager::DEFAULT_LIST_END;
use tally_queue::{JobStatus, QueueConfig};

use super::{open_queue, status_cell};

/// Arguments for the list command
#[derive(Args)]
pub struct ListArgs {
    /// waiting, delayed, active, completed or failed
    status: JobStatus,

    /// First rank to show
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    start: i64,

    /// Last rank to show (-1 for all)
    #[arg(long, default_value_t = DEFAULT_LIST_END, allow_negative_numbers = true)]
    end: i64,
}

/// Run the list command
pub async fn run(config: &QueueConfig, args: ListArgs) -> Result<()> {
    let queue = open_queue(config).await?;
    let jobs = queue
        .list_by_status(args.status, args.start, args.end)
        .await?;
    queue.close().await?;

    if jobs.is_empty() {
        println!("No {} jobs in {}", args.status, config.queue_name.cyan());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Type").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Priority").fg(Color::Cyan),
            Cell::new("Attempts").fg(Color::Cyan),
            Cell::new("Progress").fg(Color::Cyan),
            Cell::new("Updated").fg(Color::Cyan),
        ]);

    for job in &jobs {
        table.add_row(vec![
            Cell::new(&job.id).fg(Color::Green),
            Cell::new(&job.job_type),
            status_cell(job.status),
            Cell::new(job.priority),
            Cell::new(format!("{}/{}", job.attempts, job.max_attempts)),
            Cell::new(format!("{}%", job.progress)),
            Cell::new(job.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!("{table}");
    println!("{} job(s)", jobs.len());
    Ok(())
}
