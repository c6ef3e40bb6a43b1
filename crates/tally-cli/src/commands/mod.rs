//! Subcommands and the store plumbing they share

pub mod clean;
pub mod enqueue;
pub mod get;
pub mod list;
pub mod stats;
pub mod worker;

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, Color};
use std::sync::Arc;

use tally_queue::{JobQueue, JobStatus, QueueConfig};

/// Store selection, overriding `TALLY_STORE_URL` / `TALLY_QUEUE`
#[derive(Args)]
pub struct StoreArgs {
    /// Store URL (memory, sqlite:..., redis://...)
    #[arg(long, global = true)]
    store: Option<String>,

    /// Queue name
    #[arg(long, global = true)]
    queue: Option<String>,
}

impl StoreArgs {
    /// Environment configuration with command-line overrides applied.
    pub fn resolve(&self) -> Result<QueueConfig> {
        let mut config = QueueConfig::from_env().context("Invalid queue configuration")?;
        if let Some(store) = &self.store {
            config.store_url = store.clone();
        }
        if let Some(queue) = &self.queue {
            config.queue_name = queue.clone();
        }
        Ok(config)
    }
}

pub async fn open_queue(config: &QueueConfig) -> Result<Arc<JobQueue>> {
    let store = tally_persist::open_store(&config.store_url)
        .await
        .with_context(|| format!("Failed to open store at {}", config.store_url))?;
    Ok(Arc::new(JobQueue::new(store, config.queue_name.clone())))
}

pub fn status_cell(status: JobStatus) -> Cell {
    let color = match status {
        JobStatus::Waiting => Color::Blue,
        JobStatus::Delayed => Color::Yellow,
        JobStatus::Active => Color::Cyan,
        JobStatus::Completed => Color::Green,
        JobStatus::Failed => Color::Red,
    };
    Cell::new(status).fg(color)
}
