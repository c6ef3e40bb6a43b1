//! Integration tests for the tally-queue worker pool

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tally_queue::backend::{Batch, StoreAdapter, StoreError};
use tally_queue::{
    BackoffStrategy, JobOptions, JobQueue, JobStatus, MemoryStore, ProcessorRegistry,
    QueueError, QueueEvent, QueueStats, WorkerConfig, WorkerPool,
};

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_busy_interval(Duration::from_millis(5))
        .with_error_backoff(Duration::from_millis(20))
        .with_drain_interval(Duration::from_millis(10))
}

fn memory_queue() -> Arc<JobQueue> {
    Arc::new(JobQueue::new(Arc::new(MemoryStore::new()), "worker-tests"))
}

fn no_backoff() -> JobOptions {
    JobOptions::new().with_backoff(BackoffStrategy::Fixed { delay_ms: 0 })
}

async fn wait_for_stats(queue: &JobQueue, done: impl Fn(&QueueStats) -> bool) -> QueueStats {
    for _ in 0..500 {
        let stats = queue.stats().await.unwrap();
        if done(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for queue state");
}

/// Memory store with injectable faults
#[derive(Debug, Default)]
struct FlakyStore {
    inner: MemoryStore,
    /// Pops that report a lost connection before touching the store
    pop_failures: AtomicU32,
    /// `set_record` calls that report a lost connection
    write_failures: AtomicU32,
    /// Extra latency on unguarded batch replies, after the write is applied
    batch_delay: Option<Duration>,
    /// Rewrite the first job body read, as another worker would in between
    race_body_read: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self::default()
    }

    fn failing_pops(self, n: u32) -> Self {
        self.pop_failures.store(n, Ordering::SeqCst);
        self
    }

    fn failing_writes(self, n: u32) -> Self {
        self.write_failures.store(n, Ordering::SeqCst);
        self
    }

    fn slow_batches(mut self, delay: Duration) -> Self {
        self.batch_delay = Some(delay);
        self
    }

    fn racing_body_read(self) -> Self {
        self.race_body_read.store(true, Ordering::SeqCst);
        self
    }
}

fn take_fault(counter: &AtomicU32) -> Result<(), StoreError> {
    match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
        Ok(_) => Err(StoreError::Connection("connection refused".into())),
        Err(_) => Ok(()),
    }
}

#[async_trait]
impl StoreAdapter for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn is_healthy(&self) -> bool {
        self.pop_failures.load(Ordering::SeqCst) == 0
    }

    async fn get_record(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self.inner.get_record(key).await?;
        if key.contains(":job:") && self.race_body_read.swap(false, Ordering::SeqCst) {
            if let Some(raw) = &value {
                let mut body: serde_json::Value = serde_json::from_str(raw).unwrap();
                body["attempts"] = json!(1);
                body["error"] = json!("failed on another worker");
                self.inner.set_record(key, &body.to_string()).await?;
            }
        }
        Ok(value)
    }

    async fn set_record(&self, key: &str, value: &str) -> Result<(), StoreError> {
        take_fault(&self.write_failures)?;
        self.inner.set_record(key, value).await
    }

    async fn delete_record(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete_record(key).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.inner.zadd(key, member, score).await
    }

    async fn zpop_max(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        take_fault(&self.pop_failures)?;
        self.inner.zpop_max(key).await
    }

    async fn zpop_max_into(
        &self,
        src: &str,
        dst: &str,
        score: f64,
    ) -> Result<Option<(String, f64)>, StoreError> {
        take_fault(&self.pop_failures)?;
        self.inner.zpop_max_into(src, dst, score).await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        self.inner.zrange_by_score(key, min, max).await
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.inner.zrange(key, start, stop).await
    }

    async fn zrevrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        self.inner.zrevrange(key, start, stop).await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        self.inner.zscore(key, member).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.zrem(key, member).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.zcard(key).await
    }

    async fn exec_batch(&self, batch: Batch) -> Result<bool, StoreError> {
        let unguarded = batch.guards().is_empty();
        let applied = self.inner.exec_batch(batch).await?;
        if let (true, Some(delay)) = (unguarded, self.batch_delay) {
            tokio::time::sleep(delay).await;
        }
        Ok(applied)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_processes_by_priority() {
    let queue = memory_queue();
    for priority in [1, 5, 3] {
        queue
            .enqueue(
                "record",
                json!({ "priority": priority }),
                JobOptions::new().with_priority(priority),
            )
            .await
            .unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = ProcessorRegistry::new();
    let sink = seen.clone();
    registry.register_fn("record", move |payload, _progress| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(payload["priority"].as_i64().unwrap());
            Ok(json!({"ok": true}))
        }
    });

    let pool = WorkerPool::new(queue.clone(), Arc::new(registry), fast_config().with_concurrency(1));
    pool.start();
    wait_for_stats(&queue, |s| s.completed == 3).await;
    pool.stop().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![5, 3, 1]);
}

#[tokio::test]
async fn test_retries_until_attempts_exhausted() {
    let queue = memory_queue();
    let id = queue
        .enqueue("flaky", json!({}), no_backoff().with_max_attempts(2))
        .await
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let registry = ProcessorRegistry::new();
    let counter = calls.clone();
    registry.register_fn("flaky", move |_payload, _progress| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Err(anyhow::anyhow!("ERP timeout on call {}", n)) }
    });

    let pool = WorkerPool::new(queue.clone(), Arc::new(registry), fast_config());
    pool.start();
    wait_for_stats(&queue, |s| s.failed == 1).await;
    pool.stop().await.unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.error.as_deref(), Some("ERP timeout on call 2"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_then_success() {
    let queue = memory_queue();
    let id = queue.enqueue("once", json!({}), no_backoff()).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let registry = ProcessorRegistry::new();
    let counter = calls.clone();
    registry.register_fn("once", move |_payload, _progress| {
        let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
        async move {
            if first {
                anyhow::bail!("transient");
            }
            Ok(json!("sent"))
        }
    });

    let pool = WorkerPool::new(queue.clone(), Arc::new(registry), fast_config());
    pool.start();
    wait_for_stats(&queue, |s| s.completed == 1).await;
    pool.stop().await.unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.result, Some(json!("sent")));
}

#[tokio::test]
async fn test_unknown_type_fails_job() {
    let queue = memory_queue();
    let id = queue
        .enqueue("nobody_handles_this", json!({}), JobOptions::new().with_max_attempts(1))
        .await
        .unwrap();

    let pool = WorkerPool::new(queue.clone(), Arc::new(ProcessorRegistry::new()), fast_config());
    pool.start();
    wait_for_stats(&queue, |s| s.failed == 1).await;
    pool.stop().await.unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.error.as_deref(), Some("Unknown job type: nobody_handles_this"));
}

#[tokio::test]
async fn test_panicking_handler_fails_job_and_frees_slot() {
    let queue = memory_queue();
    let bad = queue
        .enqueue("explode", json!({"fuse": 0}), JobOptions::new().with_max_attempts(1))
        .await
        .unwrap();
    queue
        .enqueue("explode", json!({"fuse": 1}), JobOptions::new().with_max_attempts(1))
        .await
        .unwrap();

    let registry = ProcessorRegistry::new();
    registry.register_fn("explode", |payload, _progress| async move {
        if payload["fuse"] == 0 {
            panic!("boom");
        }
        Ok(json!("defused"))
    });

    let pool = WorkerPool::new(queue.clone(), Arc::new(registry), fast_config().with_concurrency(1));
    pool.start();
    wait_for_stats(&queue, |s| s.failed == 1 && s.completed == 1).await;
    pool.stop().await.unwrap();

    let job = queue.get_job(&bad).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Handler panicked: boom"));
    assert_eq!(pool.active_jobs(), 0);
}

#[tokio::test]
async fn test_progress_is_recorded() {
    let queue = memory_queue();
    let id = queue.enqueue("steps", json!({}), JobOptions::new()).await.unwrap();

    let registry = ProcessorRegistry::new();
    registry.register_fn("steps", |_payload, progress| async move {
        progress.report(40).await;
        progress.report(150).await;
        Ok(json!(null))
    });

    let pool = WorkerPool::new(queue.clone(), Arc::new(registry), fast_config());
    pool.start();
    wait_for_stats(&queue, |s| s.completed == 1).await;
    pool.stop().await.unwrap();

    assert_eq!(queue.get_job(&id).await.unwrap().unwrap().progress, 100);
}

#[tokio::test]
async fn test_stop_waits_for_running_job() {
    let queue = memory_queue();
    let id = queue.enqueue("slow", json!({}), JobOptions::new()).await.unwrap();

    let registry = ProcessorRegistry::new();
    registry.register_fn("slow", |_payload, _progress| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(json!("done"))
    });

    let pool = WorkerPool::new(queue.clone(), Arc::new(registry), fast_config());
    pool.start();
    while pool.active_jobs() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    pool.stop().await.unwrap();

    assert!(!pool.is_running());
    assert_eq!(pool.active_jobs(), 0);
    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_stopped_pool_claims_nothing() {
    let queue = memory_queue();
    let pool = WorkerPool::new(queue.clone(), Arc::new(ProcessorRegistry::new()), fast_config());
    pool.start();
    pool.stop().await.unwrap();

    queue.enqueue("late", json!({}), JobOptions::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.stats().await.unwrap().waiting, 1);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let queue = memory_queue();
    for i in 0..6 {
        queue.enqueue("work", json!({ "i": i }), JobOptions::new()).await.unwrap();
    }

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let registry = ProcessorRegistry::new();
    let (r, p) = (running.clone(), peak.clone());
    registry.register_fn("work", move |_payload, _progress| {
        let (running, peak) = (r.clone(), p.clone());
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(null))
        }
    });

    let pool = WorkerPool::new(queue.clone(), Arc::new(registry), fast_config().with_concurrency(2));
    pool.start();
    wait_for_stats(&queue, |s| s.completed == 6).await;
    pool.stop().await.unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_loop_survives_store_errors() {
    let queue = Arc::new(JobQueue::new(Arc::new(FlakyStore::new().failing_pops(2)), "flaky-store"));
    let mut events = queue.subscribe();
    let id = queue.enqueue("echo", json!({"x": 1}), JobOptions::new()).await.unwrap();

    let registry = ProcessorRegistry::new();
    registry.register_fn("echo", |payload, _progress| async move { Ok(payload) });

    let pool = WorkerPool::new(queue.clone(), Arc::new(registry), fast_config());
    pool.start();
    wait_for_stats(&queue, |s| s.completed == 1).await;
    pool.stop().await.unwrap();

    assert_eq!(
        queue.get_job(&id).await.unwrap().unwrap().result,
        Some(json!({"x": 1}))
    );

    let mut store_errors = 0;
    while let Ok(event) = events.try_recv() {
        if let QueueEvent::StoreError { message } = event {
            assert!(message.contains("connection refused"));
            store_errors += 1;
        }
    }
    assert_eq!(store_errors, 2);
}

#[tokio::test]
async fn test_worker_stats() {
    let queue = memory_queue();
    queue.enqueue("idle", json!({}), JobOptions::new()).await.unwrap();

    let pool = WorkerPool::new(queue.clone(), Arc::new(ProcessorRegistry::new()), fast_config().with_concurrency(3));
    let stats = pool.stats().await.unwrap();
    assert!(!stats.is_running);
    assert_eq!(stats.concurrency, 3);
    assert_eq!(stats.active_jobs, 0);
    assert_eq!(stats.queue_stats.waiting, 1);

    let value = serde_json::to_value(&stats).unwrap();
    assert_eq!(value["isRunning"], json!(false));
    assert_eq!(value["queueStats"]["waiting"], json!(1));
}

#[tokio::test]
async fn test_concurrent_dequeue_claims_each_job_once() {
    let queue = memory_queue();
    let mut expected = HashSet::new();
    for i in 0..50 {
        expected.insert(queue.enqueue("t", json!({ "i": i }), JobOptions::new()).await.unwrap());
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = queue.dequeue_next().await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job claimed twice");
        }
    }
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_stop_waits_for_quickly_retried_job() {
    let store = FlakyStore::new().slow_batches(Duration::from_millis(50));
    let queue = Arc::new(JobQueue::new(Arc::new(store), "fast-retry"));
    let id = queue.enqueue("flaky", json!({}), no_backoff()).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let finished = Arc::new(AtomicBool::new(false));
    let registry = ProcessorRegistry::new();
    let (counter, done) = (calls.clone(), finished.clone());
    registry.register_fn("flaky", move |_payload, _progress| {
        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let done = done.clone();
        async move {
            if call == 1 {
                anyhow::bail!("first attempt fails");
            }
            tokio::time::sleep(Duration::from_millis(400)).await;
            done.store(true, Ordering::SeqCst);
            Ok(json!("second attempt"))
        }
    });

    let pool = WorkerPool::new(queue.clone(), Arc::new(registry), fast_config().with_concurrency(2));
    pool.start();
    for _ in 0..400 {
        if calls.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(pool.active_jobs() >= 1);

    pool.stop().await.unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(pool.active_jobs(), 0);
    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_failed_pop_leaves_job_waiting() {
    let queue = JobQueue::new(Arc::new(FlakyStore::new().failing_pops(1)), "failed-pop");
    let id = queue.enqueue("t", json!({}), JobOptions::new()).await.unwrap();

    assert!(matches!(
        queue.dequeue_next().await,
        Err(QueueError::StoreUnavailable(StoreError::Connection(_)))
    ));
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.total(), 1);

    assert_eq!(queue.dequeue_next().await.unwrap().unwrap().id, id);
}

#[tokio::test]
async fn test_failed_claim_write_returns_job_to_waiting() {
    let queue = JobQueue::new(Arc::new(FlakyStore::new().failing_writes(1)), "failed-claim");
    let id = queue
        .enqueue("t", json!({}), JobOptions::new().with_priority(4))
        .await
        .unwrap();

    assert!(matches!(
        queue.dequeue_next().await,
        Err(QueueError::StoreUnavailable(_))
    ));
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.total(), 1);
    assert_eq!(
        queue.store().zscore(&queue.keys().waiting, &id).await.unwrap(),
        Some(4.0)
    );
    assert_eq!(queue.get_job(&id).await.unwrap().unwrap().status, JobStatus::Waiting);

    let job = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Active);
}

#[tokio::test]
async fn test_promotion_keeps_body_changed_after_read() {
    let queue = JobQueue::new(Arc::new(FlakyStore::new().racing_body_read()), "racing-promote");
    let id = queue
        .enqueue("t", json!({}), JobOptions::new().with_delay(Duration::from_millis(10)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(queue.promote_delayed().await.unwrap(), 0);
    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Delayed);
    assert_eq!(job.attempts, 1);
    assert_eq!(queue.stats().await.unwrap().delayed, 1);

    assert_eq!(queue.promote_delayed().await.unwrap(), 1);
    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error.as_deref(), Some("failed on another worker"));
}
