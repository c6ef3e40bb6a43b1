//! # Tally Queue
//!
//! Durable priority job queue and worker pool for survey dispatch.
//!
//! Features:
//! - Job records and sorted-set indices behind a pluggable [`StoreAdapter`]
//! - Priority ordering, delayed jobs, retry with backoff
//! - Worker pool with bounded concurrency and graceful stop
//! - Lifecycle events on a broadcast channel
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tally_queue::{JobOptions, JobQueue, MemoryStore, ProcessorRegistry, WorkerConfig, WorkerPool};
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = Arc::new(JobQueue::new(Arc::new(MemoryStore::new()), "surveys"));
//!
//!     let registry = ProcessorRegistry::new();
//!     registry.register_fn("echo", |payload, _progress| async move { Ok(payload) });
//!
//!     let pool = WorkerPool::new(queue.clone(), Arc::new(registry), WorkerConfig::default());
//!     pool.start();
//!
//!     queue
//!         .enqueue("echo", serde_json::json!({"hello": "world"}), JobOptions::new())
//!         .await
//!         .unwrap();
//!
//!     pool.stop().await.unwrap();
//! }
//! ```

pub mod backend;
pub mod config;
pub mod events;
pub mod job;
pub mod manager;
pub mod memory;
pub mod processor;
pub mod queue;
pub mod worker;

pub use backend::{Batch, BatchGuard, QueueError, StoreAdapter, StoreError, StoreOp};
pub use config::{ConfigError, QueueConfig};
pub use events::{spawn_event_logger, QueueEvent};
pub use job::{BackoffStrategy, JobId, JobOptions, JobRecord, JobStatus};
pub use manager::{
    CleanupReport, CustomerFilters, DateRange, ErpCustomersPayload, JobKind, JobManager,
    ManualNumbersPayload, SurveyBatchPayload,
};
pub use memory::MemoryStore;
pub use processor::{JobHandler, Processor, ProcessorError, ProcessorRegistry, ProgressReporter};
pub use queue::{JobQueue, Producer, QueueKeys, QueueStats};
pub use worker::{WorkerConfig, WorkerPool, WorkerStats};
