//! Worker Pool for processing jobs

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::QueueError;
use crate::job::{JobId, JobRecord};
use crate::processor::{Processor, ProcessorError, ProgressReporter};
use crate::queue::{JobQueue, QueueStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Maximum jobs executing at once
    pub concurrency: usize,
    /// Wait after finding the queue empty
    pub poll_interval: Duration,
    /// Wait while every slot is busy
    pub busy_interval: Duration,
    /// Wait after the poll loop hits a store error
    pub error_backoff: Duration,
    /// How often `stop` re-checks in-flight jobs
    pub drain_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(1000),
            busy_interval: Duration::from_millis(100),
            error_backoff: Duration::from_millis(5000),
            drain_interval: Duration::from_millis(1000),
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_busy_interval(mut self, interval: Duration) -> Self {
        self.busy_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub is_running: bool,
    pub concurrency: usize,
    pub active_jobs: usize,
    pub queue_stats: QueueStats,
}

/// Each execution gets its own claim token: a job that fails and is claimed
/// again before the first run's task has ended holds two claims.
#[derive(Debug, Default)]
struct PoolState {
    running: AtomicBool,
    next_claim: AtomicU64,
    claimed: Mutex<HashMap<u64, JobId>>,
    wake: Notify,
    poll_loop: Mutex<Option<JoinHandle<()>>>,
}

impl PoolState {
    fn claimed_len(&self) -> usize {
        self.claimed.lock().expect("Claimed-set mutex poisoned").len()
    }

    fn claimed_ids(&self) -> Vec<JobId> {
        self.claimed
            .lock()
            .expect("Claimed-set mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn claim(self: &Arc<Self>, id: &str) -> ClaimGuard {
        let token = self.next_claim.fetch_add(1, Ordering::SeqCst);
        self.claimed
            .lock()
            .expect("Claimed-set mutex poisoned")
            .insert(token, id.to_string());
        ClaimGuard {
            state: self.clone(),
            token,
        }
    }

    fn release(&self, token: u64) {
        self.claimed
            .lock()
            .expect("Claimed-set mutex poisoned")
            .remove(&token);
    }
}

/// Releases one claim when the execution task ends, even by panic.
struct ClaimGuard {
    state: Arc<PoolState>,
    token: u64,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.state.release(self.token);
    }
}

/// Concurrency-bounded poll loop driving claimed jobs to a terminal state.
///
/// One sequential loop claims jobs; each claimed job runs in its own task.
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    processor: Arc<dyn Processor>,
    config: WorkerConfig,
    state: Arc<PoolState>,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, processor: Arc<dyn Processor>, config: WorkerConfig) -> Self {
        Self {
            queue,
            processor,
            config,
            state: Arc::new(PoolState::default()),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Number of jobs claimed by this pool and not yet finished
    pub fn active_jobs(&self) -> usize {
        self.state.claimed_len()
    }

    /// Spawn the poll loop. Calling `start` on a running pool does nothing.
    pub fn start(&self) {
        if self.state.running.swap(true, Ordering::SeqCst) {
            warn!(queue = %self.queue.name(), "Worker pool already running");
            return;
        }

        let pool = self.clone();
        let handle = tokio::spawn(async move { pool.poll_loop().await });
        *self
            .state
            .poll_loop
            .lock()
            .expect("Poll-loop handle mutex poisoned") = Some(handle);

        info!(
            queue = %self.queue.name(),
            concurrency = self.config.concurrency,
            "Worker pool started"
        );
    }

    /// Stop claiming, wait for in-flight jobs, then release the store.
    ///
    /// There is no forced cancellation: a handler that never returns keeps
    /// this waiting.
    pub async fn stop(&self) -> Result<(), QueueError> {
        self.state.running.store(false, Ordering::SeqCst);
        self.state.wake.notify_one();

        let handle = self
            .state
            .poll_loop
            .lock()
            .expect("Poll-loop handle mutex poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Poll loop ended abnormally");
            }
        }

        loop {
            let active = self.active_jobs();
            if active == 0 {
                break;
            }
            info!(active, jobs = ?self.state.claimed_ids(), "Waiting for active jobs to complete...");
            tokio::time::sleep(self.config.drain_interval).await;
        }

        self.queue.close().await?;
        info!(queue = %self.queue.name(), "Worker pool stopped");
        Ok(())
    }

    pub async fn stats(&self) -> Result<WorkerStats, QueueError> {
        Ok(WorkerStats {
            is_running: self.is_running(),
            concurrency: self.config.concurrency,
            active_jobs: self.active_jobs(),
            queue_stats: self.queue.stats().await?,
        })
    }

    /// Sleep for `duration`, returning early if `stop` is called.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.state.wake.notified() => {}
        }
    }

    async fn poll_loop(&self) {
        while self.is_running() {
            if self.active_jobs() >= self.config.concurrency {
                self.pause(self.config.busy_interval).await;
                continue;
            }

            match self.queue.dequeue_next().await {
                Ok(Some(job)) => {
                    let guard = self.state.claim(&job.id);
                    self.spawn_execution(job, guard);
                }
                Ok(None) => self.pause(self.config.poll_interval).await,
                Err(e) => {
                    error!(error = %e, "Error in job processing loop");
                    self.queue.report_error(&e);
                    self.pause(self.config.error_backoff).await;
                }
            }
        }
        debug!(queue = %self.queue.name(), "Poll loop exited");
    }

    fn spawn_execution(&self, job: JobRecord, guard: ClaimGuard) {
        let queue = self.queue.clone();
        let processor = self.processor.clone();

        tokio::spawn(async move {
            let _guard = guard;
            execute(queue, processor, job).await;
        });
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queue", &self.queue.name())
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("active_jobs", &self.active_jobs())
            .finish()
    }
}

async fn execute(queue: Arc<JobQueue>, processor: Arc<dyn Processor>, job: JobRecord) {
    info!(
        job_id = %job.id,
        job_type = %job.job_type,
        attempt = job.attempts + 1,
        "Processing job"
    );

    let progress = ProgressReporter::new(queue.clone(), job.id.clone());
    let outcome = AssertUnwindSafe(processor.process(&job, progress))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ProcessorError::Panicked(panic_message(panic.as_ref()))));

    match outcome {
        Ok(result) => {
            if let Err(e) = queue.complete_job(&job.id, result).await {
                error!(job_id = %job.id, error = %e, "Failed to mark job completed");
            }
        }
        Err(e) => {
            warn!(job_id = %job.id, job_type = %job.job_type, error = %e, "Job failed");
            if let Err(e) = queue.fail_job(&job.id, &e.to_string()).await {
                error!(job_id = %job.id, error = %e, "Failed to record job failure");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
