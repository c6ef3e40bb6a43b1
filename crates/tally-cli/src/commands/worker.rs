//! Worker command - Process jobs until SIGINT or SIGTERM
//!
//! Registers the built-in `echo` handler, which returns its payload and is
//! meant for smoke-testing a deployment end to end.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use tally_queue::{spawn_event_logger, ProcessorRegistry, QueueConfig, WorkerPool};

use super::open_queue;
use crate::print_info;

/// Arguments for the worker command
#[derive(Args)]
pub struct WorkerArgs {
    /// Maximum jobs executing at once (overrides TALLY_CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,
}

fn builtin_registry() -> ProcessorRegistry {
    let registry = ProcessorRegistry::new();
    registry.register_fn("echo", |payload, progress| async move {
        progress.report(100).await;
        Ok(payload)
    });
    registry
}

/// Run the worker command
pub async fn run(config: QueueConfig, args: WorkerArgs) -> Result<()> {
    let mut worker_config = config.worker_config();
    if let Some(concurrency) = args.concurrency {
        worker_config = worker_config.with_concurrency(concurrency);
    }

    let queue = open_queue(&config).await?;
    let registry = builtin_registry();
    let handlers = registry.job_types();

    let logger = spawn_event_logger(queue.subscribe());
    let pool = WorkerPool::new(queue.clone(), Arc::new(registry), worker_config);
    pool.start();

    print_info(&format!(
        "Worker running on {} (concurrency {}, handlers: {})",
        config.queue_name.cyan(),
        worker_config.concurrency,
        handlers.join(", ").green()
    ));

    shutdown_signal().await?;
    info!("Received shutdown signal, stopping worker");

    pool.stop().await.context("Worker did not stop cleanly")?;
    drop(pool);
    drop(queue);
    // The logger ends once the last queue handle is gone
    if tokio::time::timeout(Duration::from_secs(1), logger).await.is_err() {
        warn!("Event logger still running at exit");
    }

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")
}
