//! Job record store and scheduler
//!
//! A queue named `Q` keeps one body record per job at `Q:job:<id>` and five
//! sorted sets of ids:
//!
//! | set            | score                         |
//! |----------------|-------------------------------|
//! | `Q:waiting`    | priority (higher pops first)  |
//! | `Q:delayed`    | execute-at, epoch ms          |
//! | `Q:processing` | claim time, epoch ms          |
//! | `Q:completed`  | completion time, epoch ms     |
//! | `Q:failed`     | failure time, epoch ms        |
//!
//! A job id is a member of at most one of them. Claiming relies on the
//! store's atomic `zpop_max_into`: a popped id belongs to exactly one caller
//! and is never outside every index.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::backend::{Batch, QueueError, StoreAdapter};
use crate::events::{QueueEvent, EVENT_CHANNEL_CAPACITY};
use crate::job::{clamp_progress, JobId, JobOptions, JobRecord, JobStatus};

/// Anything that can accept new work.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError>;
}

/// Store keys for one named queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    name: String,
    pub waiting: String,
    pub delayed: String,
    pub processing: String,
    pub completed: String,
    pub failed: String,
}

impl QueueKeys {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            waiting: format!("{}:waiting", name),
            delayed: format!("{}:delayed", name),
            processing: format!("{}:processing", name),
            completed: format!("{}:completed", name),
            failed: format!("{}:failed", name),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.name, id)
    }

    pub fn index(&self, status: JobStatus) -> &str {
        match status {
            JobStatus::Waiting => &self.waiting,
            JobStatus::Delayed => &self.delayed,
            JobStatus::Active => &self.processing,
            JobStatus::Completed => &self.completed,
            JobStatus::Failed => &self.failed,
        }
    }

    /// Sets a not-yet-terminal job can be sitting in.
    fn pending_indices(&self) -> [&str; 3] {
        [&self.waiting, &self.delayed, &self.processing]
    }
}

/// Per-status job counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl QueueStats {
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Waiting => self.waiting,
            JobStatus::Delayed => self.delayed,
            JobStatus::Active => self.active,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

fn epoch_ms(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

/// Durable priority queue over a [`StoreAdapter`].
#[derive(Debug)]
pub struct JobQueue {
    store: Arc<dyn StoreAdapter>,
    keys: QueueKeys,
    events: broadcast::Sender<QueueEvent>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn StoreAdapter>, name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            keys: QueueKeys::new(name),
            events,
        }
    }

    pub fn name(&self) -> &str {
        self.keys.name()
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn StoreAdapter> {
        &self.store
    }

    /// Receive lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: QueueEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    /// Surface an infrastructure failure to subscribers.
    pub fn report_error(&self, error: &QueueError) {
        self.publish(QueueEvent::StoreError {
            message: error.to_string(),
        });
    }

    async fn load(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        match self.store.get_record(&self.keys.job(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn load_existing(&self, id: &str) -> Result<JobRecord, QueueError> {
        self.load(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
    }

    fn encode(job: &JobRecord) -> Result<String, QueueError> {
        Ok(serde_json::to_string(job)?)
    }

    /// Persist a new job and index it as waiting or delayed.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        if options.max_attempts == Some(0) {
            return Err(QueueError::InvalidArgument(
                "maxAttempts must be at least 1".into(),
            ));
        }

        let now = Utc::now();
        let job = JobRecord::new(job_type, payload, &options, now);

        let mut batch = Batch::new();
        batch.set_record(self.keys.job(&job.id), Self::encode(&job)?);
        match job.status {
            JobStatus::Delayed => {
                batch.zadd(&self.keys.delayed, &job.id, epoch_ms(job.scheduled_at()))
            }
            _ => batch.zadd(&self.keys.waiting, &job.id, job.priority as f64),
        };
        self.store.exec_batch(batch).await?;

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = job.priority,
            delay_ms = job.delay_ms,
            "Job enqueued"
        );
        let id = job.id.clone();
        self.publish(QueueEvent::Added(job));
        Ok(id)
    }

    /// Move every delayed job whose execute time has passed back to waiting.
    ///
    /// Each move is a batch guarded on the delayed set and on the body as it
    /// was read, so concurrent callers promote a given id at most once and
    /// never write back a body that changed in between. Returns the number
    /// of jobs promoted.
    pub async fn promote_delayed(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let due = self
            .store
            .zrange_by_score(&self.keys.delayed, 0.0, epoch_ms(now))
            .await?;

        let mut promoted = 0;
        for id in due {
            let key = self.keys.job(&id);
            let mut batch = Batch::guarded(&self.keys.delayed, &id);

            let raw = self.store.get_record(&key).await?;
            let body = match raw.as_deref().map(serde_json::from_str::<JobRecord>) {
                Some(Ok(job)) => Some(job),
                Some(Err(e)) => {
                    warn!(job_id = %id, error = %e, "Dropping delayed job with unreadable body");
                    None
                }
                None => {
                    warn!(job_id = %id, "Delayed job has no stored body");
                    None
                }
            };

            let has_body = body.is_some();
            if let (Some(mut job), Some(raw)) = (body, raw) {
                job.status = JobStatus::Waiting;
                job.updated_at = now;
                batch
                    .expect_record(&key, raw)
                    .set_record(&key, Self::encode(&job)?)
                    .zadd(&self.keys.waiting, &id, job.priority as f64);
            }
            batch.zrem(&self.keys.delayed, &id);

            if self.store.exec_batch(batch).await? && has_body {
                debug!(job_id = %id, "Promoted delayed job");
                promoted += 1;
            }
        }

        Ok(promoted)
    }

    /// Claim the highest-priority waiting job.
    ///
    /// Among jobs of equal priority the order is whatever the store's
    /// equal-score pop yields; callers must not rely on it.
    pub async fn dequeue_next(&self) -> Result<Option<JobRecord>, QueueError> {
        self.promote_delayed().await?;

        loop {
            let now = Utc::now();
            let Some((id, priority)) = self
                .store
                .zpop_max_into(&self.keys.waiting, &self.keys.processing, epoch_ms(now))
                .await?
            else {
                return Ok(None);
            };

            match self.activate(&id, now).await {
                Ok(Some(job)) => {
                    self.publish(QueueEvent::Active(job.clone()));
                    return Ok(Some(job));
                }
                Ok(None) => {
                    self.store.zrem(&self.keys.processing, &id).await?;
                }
                Err(e) => {
                    self.requeue(&id, priority).await;
                    return Err(e);
                }
            }
        }
    }

    /// Mark a just-claimed job active. `None` if its body is gone or unreadable.
    async fn activate(&self, id: &str, now: DateTime<Utc>) -> Result<Option<JobRecord>, QueueError> {
        let mut job = match self.load(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %id, "Claimed job has no stored body, skipping");
                return Ok(None);
            }
            Err(QueueError::Serialization(e)) => {
                warn!(job_id = %id, error = %e, "Claimed job has unreadable body, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        job.status = JobStatus::Active;
        job.processing_started_at = Some(now);
        job.updated_at = now;
        self.store
            .set_record(&self.keys.job(id), &Self::encode(&job)?)
            .await?;
        Ok(Some(job))
    }

    /// Return a claimed job to waiting after its claim could not be recorded.
    async fn requeue(&self, id: &str, priority: f64) {
        let mut batch = Batch::guarded(&self.keys.processing, id);
        batch
            .zrem(&self.keys.processing, id)
            .zadd(&self.keys.waiting, id, priority);

        match self.store.exec_batch(batch).await {
            Ok(_) => debug!(job_id = %id, "Returned job to waiting"),
            Err(e) => error!(job_id = %id, error = %e, "Failed to return job to waiting"),
        }
    }

    /// Record a successful run.
    pub async fn complete_job(
        &self,
        id: &str,
        result: serde_json::Value,
    ) -> Result<JobRecord, QueueError> {
        let mut job = self.load_existing(id).await?;
        if job.status.is_terminal() {
            return Err(QueueError::InvalidArgument(format!(
                "job {} is already {}",
                id, job.status
            )));
        }

        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.processing_completed_at = Some(now);
        job.updated_at = now;

        let mut batch = Batch::new();
        batch.set_record(self.keys.job(id), Self::encode(&job)?);
        for index in self.keys.pending_indices() {
            batch.zrem(index, id);
        }
        batch.zadd(&self.keys.completed, id, epoch_ms(now));
        self.store.exec_batch(batch).await?;

        info!(job_id = %id, job_type = %job.job_type, "Job completed");
        self.publish(QueueEvent::Completed(job.clone()));
        Ok(job)
    }

    /// Record a failed run: reschedule with backoff, or fail permanently once
    /// attempts are exhausted.
    pub async fn fail_job(&self, id: &str, error: &str) -> Result<JobRecord, QueueError> {
        let mut job = self.load_existing(id).await?;
        if job.status.is_terminal() {
            return Err(QueueError::InvalidArgument(format!(
                "job {} is already {}",
                id, job.status
            )));
        }

        let now = Utc::now();
        job.attempts = job.attempts.saturating_add(1).min(job.max_attempts);
        job.error = Some(error.to_string());
        job.updated_at = now;

        let mut batch = Batch::new();
        for index in self.keys.pending_indices() {
            batch.zrem(index, id);
        }

        let retrying = job.has_attempts_left();
        if retrying {
            let delay = job.backoff.delay(job.attempts);
            let run_at = now + ChronoDuration::milliseconds(delay.as_millis() as i64);
            job.status = JobStatus::Delayed;
            batch.zadd(&self.keys.delayed, id, epoch_ms(run_at));

            info!(
                job_id = %id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Job failed, scheduling retry with backoff"
            );
        } else {
            job.status = JobStatus::Failed;
            job.processing_completed_at = Some(now);
            batch.zadd(&self.keys.failed, id, epoch_ms(now));

            warn!(
                job_id = %id,
                attempts = job.attempts,
                error = %error,
                "Job failed permanently"
            );
        }
        batch.set_record(self.keys.job(id), Self::encode(&job)?);
        self.store.exec_batch(batch).await?;

        if retrying {
            self.publish(QueueEvent::Retrying(job.clone()));
        } else {
            self.publish(QueueEvent::Failed(job.clone()));
        }
        Ok(job)
    }

    /// Store the latest progress of an active job, clamped to `0..=100`.
    pub async fn update_progress(&self, id: &str, pct: i64) -> Result<JobRecord, QueueError> {
        let mut job = self.load_existing(id).await?;
        if job.status != JobStatus::Active {
            return Err(QueueError::InvalidArgument(format!(
                "progress can only be set on active jobs, {} is {}",
                id, job.status
            )));
        }

        job.progress = clamp_progress(pct);
        job.updated_at = Utc::now();
        self.store
            .set_record(&self.keys.job(id), &Self::encode(&job)?)
            .await?;

        self.publish(QueueEvent::Progress(job.clone()));
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, QueueError> {
        self.load(id).await
    }

    /// Jobs at ranks `start..=end` of a status ordering (`end = -1` for all).
    ///
    /// Waiting jobs are listed in dequeue order, highest priority first;
    /// every other status by ascending score (oldest first).
    pub async fn list_by_status(
        &self,
        status: JobStatus,
        start: i64,
        end: i64,
    ) -> Result<Vec<JobRecord>, QueueError> {
        let index = self.keys.index(status);
        let ids = match status {
            JobStatus::Waiting => self.store.zrevrange(index, start, end).await?,
            _ => self.store.zrange(index, start, end).await?,
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (waiting, active, completed, failed, delayed) = futures::try_join!(
            self.store.zcard(&self.keys.waiting),
            self.store.zcard(&self.keys.processing),
            self.store.zcard(&self.keys.completed),
            self.store.zcard(&self.keys.failed),
            self.store.zcard(&self.keys.delayed),
        )?;

        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
        })
    }

    /// Delete completed or failed jobs that reached their terminal state at
    /// least `max_age` ago. Returns how many were removed.
    pub async fn cleanup(&self, status: JobStatus, max_age: Duration) -> Result<u64, QueueError> {
        if !status.is_terminal() {
            return Err(QueueError::InvalidArgument(format!(
                "cannot clean jobs with status: {}",
                status
            )));
        }

        let index = self.keys.index(status);
        let cutoff = Utc::now() - ChronoDuration::milliseconds(max_age.as_millis() as i64);
        let ids = self
            .store
            .zrange_by_score(index, 0.0, epoch_ms(cutoff))
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut batch = Batch::new();
        for id in &ids {
            batch.delete_record(self.keys.job(id)).zrem(index, id);
        }
        self.store.exec_batch(batch).await?;

        info!(status = %status, removed = ids.len(), "Cleaned old jobs");
        Ok(ids.len() as u64)
    }

    /// Release the store connection.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.store.close().await?;
        Ok(())
    }
}

#[async_trait]
impl Producer for JobQueue {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        JobQueue::enqueue(self, job_type, payload, options).await
    }
}
