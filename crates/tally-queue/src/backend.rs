//! Store Adapter Trait
//!
//! The queue needs three things from its store: opaque records by key, sorted
//! sets of ids with a score, and an atomic batch. Anything that can provide
//! those (an in-process map, SQLite, Redis) can back a queue.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::job::JobId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Store is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A single mutation inside a [`Batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    SetRecord { key: String, value: String },
    DeleteRecord { key: String },
    ZAdd { key: String, member: String, score: f64 },
    ZRem { key: String, member: String },
}

/// Precondition checked by the store inside a [`Batch`]'s atomic step.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchGuard {
    /// `member` is present in sorted set `key`
    Member { key: String, member: String },
    /// The record at `key` still holds exactly `value`
    Record { key: String, value: String },
}

/// Ops applied all-or-nothing.
///
/// A guarded batch is applied only if every guard holds when the store
/// executes it; otherwise nothing is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    guards: Vec<BatchGuard>,
    ops: Vec<StoreOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guarded(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            guards: vec![BatchGuard::Member {
                key: key.into(),
                member: member.into(),
            }],
            ops: Vec::new(),
        }
    }

    /// Also require the record at `key` to be unchanged since it was read.
    pub fn expect_record(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.guards.push(BatchGuard::Record {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn set_record(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::SetRecord {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete_record(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::DeleteRecord { key: key.into() });
        self
    }

    pub fn zadd(&mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> &mut Self {
        self.ops.push(StoreOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn zrem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(StoreOp::ZRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn guards(&self) -> &[BatchGuard] {
        &self.guards
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn into_parts(self) -> (Vec<BatchGuard>, Vec<StoreOp>) {
        (self.guards, self.ops)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Durable store primitives consumed by [`crate::JobQueue`].
///
/// Sorted sets follow Redis semantics: members are unique per set, adding an
/// existing member updates its score, ranges are ordered by `(score, member)`
/// ascending, and `zpop_max` removes the entry with the highest score (the
/// lexicographically greatest member among equal scores).
///
/// Implementations must be safe to share between tasks; a single adapter
/// instance is used concurrently by the poll loop and every running job.
#[async_trait]
pub trait StoreAdapter: Send + Sync + Debug {
    /// Backend name for logs
    fn name(&self) -> &str;

    async fn is_healthy(&self) -> bool;

    async fn get_record(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_record(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Returns whether a record was removed
    async fn delete_record(&self, key: &str) -> Result<bool, StoreError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Atomically remove and return the highest-scored member.
    async fn zpop_max(&self, key: &str) -> Result<Option<(String, f64)>, StoreError>;

    /// Pop the highest-scored member of `src` and add it to `dst` with
    /// `score`, as one atomic step. Returns the member and its `src` score.
    async fn zpop_max_into(
        &self,
        src: &str,
        dst: &str,
        score: f64,
    ) -> Result<Option<(String, f64)>, StoreError>;

    /// Members with `min <= score <= max`, ascending.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64)
        -> Result<Vec<String>, StoreError>;

    /// Members at inclusive ranks `start..=stop`; negative ranks count from the end.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;

    /// Like [`StoreAdapter::zrange`] over the set in descending order.
    async fn zrevrange(&self, key: &str, start: i64, stop: i64)
        -> Result<Vec<String>, StoreError>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    /// Returns whether the member was present
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Apply a batch atomically. Returns `false` if a guard was not satisfied.
    async fn exec_batch(&self, batch: Batch) -> Result<bool, StoreError>;

    /// Release the underlying connection(s).
    async fn close(&self) -> Result<(), StoreError>;
}

/// Resolve a Redis-style inclusive rank range against `len` entries.
///
/// Returns `None` when the range selects nothing.
pub fn resolve_range(len: u64, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (start + len).max(0) } else { start };
    let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}
