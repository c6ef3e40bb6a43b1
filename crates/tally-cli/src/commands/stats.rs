//! Stats command - Per-status job counts

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

use tally_queue::{JobStatus, QueueConfig};

use super::{open_queue, status_cell};

/// Arguments for the stats command
#[derive(Args)]
pub struct StatsArgs {
    /// Output raw JSON (no formatting)
    #[arg(long)]
    raw: bool,
}

/// Run the stats command
pub async fn run(config: &QueueConfig, args: StatsArgs) -> Result<()> {
    let queue = open_queue(config).await?;
    let stats = queue.stats().await?;
    queue.close().await?;

    if args.raw {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{} {}", "Queue".bold(), config.queue_name.cyan().bold());

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Jobs").fg(Color::Cyan),
        ]);

    for status in JobStatus::ALL {
        table.add_row(vec![status_cell(status), Cell::new(stats.get(status))]);
    }
    table.add_row(vec![Cell::new("total"), Cell::new(stats.total())]);

    println!("{table}");
    Ok(())
}
