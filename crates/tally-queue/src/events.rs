//! Queue lifecycle events
//!
//! Every event is published after the store mutation it describes has been
//! applied, so a subscriber that reads the store on receipt sees the new state.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::job::JobRecord;

/// Buffered events per subscriber before it starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum QueueEvent {
    /// Job was written to the store
    Added(JobRecord),
    /// Job was claimed by a worker
    Active(JobRecord),
    /// Handler reported progress
    Progress(JobRecord),
    /// Handler succeeded
    Completed(JobRecord),
    /// Handler failed and the job was rescheduled with backoff
    Retrying(JobRecord),
    /// Handler failed and no attempts remain
    Failed(JobRecord),
    /// Queue infrastructure call failed (store unreachable, etc.)
    StoreError { message: String },
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Added(_) => "job:added",
            Self::Active(_) => "job:active",
            Self::Progress(_) => "job:progress",
            Self::Completed(_) => "job:completed",
            Self::Retrying(_) => "job:retrying",
            Self::Failed(_) => "job:failed",
            Self::StoreError { .. } => "error",
        }
    }

    pub fn job(&self) -> Option<&JobRecord> {
        match self {
            Self::Added(job)
            | Self::Active(job)
            | Self::Progress(job)
            | Self::Completed(job)
            | Self::Retrying(job)
            | Self::Failed(job) => Some(job),
            Self::StoreError { .. } => None,
        }
    }
}

/// Log every lifecycle event until the channel closes.
pub fn spawn_event_logger(mut rx: broadcast::Receiver<QueueEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged behind queue events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &QueueEvent) {
    match event {
        QueueEvent::Added(job) => {
            debug!(job_id = %job.id, job_type = %job.job_type, status = %job.status, "Job added")
        }
        QueueEvent::Active(job) => info!(job_id = %job.id, "Job started processing"),
        QueueEvent::Progress(job) => {
            debug!(job_id = %job.id, progress = job.progress, "Job progress")
        }
        QueueEvent::Completed(job) => info!(job_id = %job.id, "Job completed successfully"),
        QueueEvent::Retrying(job) => info!(
            job_id = %job.id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Job will be retried"
        ),
        QueueEvent::Failed(job) => error!(
            job_id = %job.id,
            error = job.error.as_deref().unwrap_or_default(),
            "Job failed permanently"
        ),
        QueueEvent::StoreError { message } => error!(error = %message, "Queue error"),
    }
}
