//! In-memory store adapter
//!
//! Everything lives behind one lock, which makes every call (and every batch)
//! atomic with respect to the others. Useful for tests and for producers and
//! workers sharing a single process.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

use crate::backend::{resolve_range, Batch, BatchGuard, StoreAdapter, StoreError, StoreOp};

/// Sorted-set entry ordered by score, then member
#[derive(Debug, Clone)]
struct ScoredEntry {
    score: f64,
    member: String,
}

impl PartialEq for ScoredEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredEntry {}

impl Ord for ScoredEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.member.cmp(&other.member))
    }
}

impl PartialOrd for ScoredEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    entries: BTreeSet<ScoredEntry>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.entries.remove(&ScoredEntry {
                score: old,
                member: member.to_string(),
            });
        }
        self.entries.insert(ScoredEntry {
            score,
            member: member.to_string(),
        });
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.entries.remove(&ScoredEntry {
                    score,
                    member: member.to_string(),
                });
                true
            }
            None => false,
        }
    }

    fn pop_max(&mut self) -> Option<(String, f64)> {
        let entry = self.entries.pop_last()?;
        self.scores.remove(&entry.member);
        Some((entry.member, entry.score))
    }

    fn contains(&self, member: &str) -> bool {
        self.scores.contains_key(member)
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, String>,
    sets: HashMap<String, SortedSet>,
}

impl Inner {
    fn holds(&self, guard: &BatchGuard) -> bool {
        match guard {
            BatchGuard::Member { key, member } => self
                .sets
                .get(key)
                .map(|set| set.contains(member))
                .unwrap_or(false),
            BatchGuard::Record { key, value } => self.records.get(key) == Some(value),
        }
    }

    fn apply(&mut self, op: StoreOp) {
        match op {
            StoreOp::SetRecord { key, value } => {
                self.records.insert(key, value);
            }
            StoreOp::DeleteRecord { key } => {
                self.records.remove(&key);
            }
            StoreOp::ZAdd { key, member, score } => {
                self.sets.entry(key).or_default().insert(&member, score);
            }
            StoreOp::ZRem { key, member } => {
                if let Some(set) = self.sets.get_mut(&key) {
                    set.remove(&member);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn get_record(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.records.get(key).cloned())
    }

    async fn set_record(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .records
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_record(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.records.remove(key).is_some())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn zpop_max(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.sets.get_mut(key).and_then(SortedSet::pop_max))
    }

    async fn zpop_max_into(
        &self,
        src: &str,
        dst: &str,
        score: f64,
    ) -> Result<Option<(String, f64)>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some((member, popped)) = inner.sets.get_mut(src).and_then(SortedSet::pop_max) else {
            return Ok(None);
        };
        inner
            .sets
            .entry(dst.to_string())
            .or_default()
            .insert(&member, score);
        Ok(Some((member, popped)))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sets
            .get(key)
            .map(|set| {
                set.entries
                    .iter()
                    .filter(|e| e.score >= min && e.score <= max)
                    .map(|e| e.member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let Some(set) = inner.sets.get(key) else {
            return Ok(Vec::new());
        };
        let Some((start, stop)) = resolve_range(set.len() as u64, start, stop) else {
            return Ok(Vec::new());
        };
        Ok(set
            .entries
            .iter()
            .skip(start)
            .take(stop - start + 1)
            .map(|e| e.member.clone())
            .collect())
    }

    async fn zrevrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let Some(set) = inner.sets.get(key) else {
            return Ok(Vec::new());
        };
        let Some((start, stop)) = resolve_range(set.len() as u64, start, stop) else {
            return Ok(Vec::new());
        };
        Ok(set
            .entries
            .iter()
            .rev()
            .skip(start)
            .take(stop - start + 1)
            .map(|e| e.member.clone())
            .collect())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sets
            .get(key)
            .and_then(|set| set.scores.get(member).copied()))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .sets
            .get_mut(key)
            .map(|set| set.remove(member))
            .unwrap_or(false))
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.sets.get(key).map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn exec_batch(&self, batch: Batch) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;

        let (guards, ops) = batch.into_parts();
        if !guards.iter().all(|guard| inner.holds(guard)) {
            return Ok(false);
        }

        for op in ops {
            inner.apply(op);
        }
        Ok(true)
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records() {
        let store = MemoryStore::new();

        assert_eq!(store.get_record("q:job:1").await.unwrap(), None);
        store.set_record("q:job:1", "{\"a\":1}").await.unwrap();
        assert_eq!(
            store.get_record("q:job:1").await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );
        assert!(store.delete_record("q:job:1").await.unwrap());
        assert!(!store.delete_record("q:job:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_pop_max_orders_by_score() {
        let store = MemoryStore::new();
        store.zadd("z", "low", 1.0).await.unwrap();
        store.zadd("z", "high", 5.0).await.unwrap();
        store.zadd("z", "mid", 3.0).await.unwrap();

        assert_eq!(store.zpop_max("z").await.unwrap(), Some(("high".into(), 5.0)));
        assert_eq!(store.zpop_max("z").await.unwrap(), Some(("mid".into(), 3.0)));
        assert_eq!(store.zpop_max("z").await.unwrap(), Some(("low".into(), 1.0)));
        assert_eq!(store.zpop_max("z").await.unwrap(), None);
        assert_eq!(store.zpop_max("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zadd_updates_existing_member() {
        let store = MemoryStore::new();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "a", 10.0).await.unwrap();

        assert_eq!(store.zcard("z").await.unwrap(), 1);
        assert_eq!(store.zscore("z", "a").await.unwrap(), Some(10.0));
    }

    #[tokio::test]
    async fn test_ranges() {
        let store = MemoryStore::new();
        for (member, score) in [("a", 10.0), ("b", 20.0), ("c", 30.0), ("d", 40.0)] {
            store.zadd("z", member, score).await.unwrap();
        }

        assert_eq!(
            store.zrange_by_score("z", 0.0, 25.0).await.unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(store.zrange("z", 0, -1).await.unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(store.zrange("z", 1, 2).await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.zrange("z", -1, -1).await.unwrap(), vec!["d"]);
        assert!(store.zrange("z", 5, 9).await.unwrap().is_empty());
        assert_eq!(store.zrevrange("z", 0, 1).await.unwrap(), vec!["d", "c"]);
        assert_eq!(store.zrevrange("z", -1, -1).await.unwrap(), vec!["a"]);

        assert!(store.zrem("z", "b").await.unwrap());
        assert!(!store.zrem("z", "b").await.unwrap());
        assert_eq!(store.zcard("z").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_guarded_batch() {
        let store = MemoryStore::new();
        store.zadd("delayed", "job", 1.0).await.unwrap();

        let mut batch = Batch::guarded("delayed", "job");
        batch.zadd("waiting", "job", 0.0).zrem("delayed", "job");
        assert!(store.exec_batch(batch.clone()).await.unwrap());
        assert_eq!(store.zcard("waiting").await.unwrap(), 1);
        assert_eq!(store.zcard("delayed").await.unwrap(), 0);

        // Second application finds the guard gone and writes nothing.
        store.zrem("waiting", "job").await.unwrap();
        assert!(!store.exec_batch(batch).await.unwrap());
        assert_eq!(store.zcard("waiting").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_record_guard_rejects_changed_body() {
        let store = MemoryStore::new();
        store.set_record("job", "v1").await.unwrap();

        let mut stale = Batch::new();
        stale.expect_record("job", "v0").set_record("job", "v2");
        assert!(!store.exec_batch(stale).await.unwrap());
        assert_eq!(store.get_record("job").await.unwrap().as_deref(), Some("v1"));

        let mut current = Batch::new();
        current.expect_record("job", "v1").set_record("job", "v2");
        assert!(store.exec_batch(current).await.unwrap());
        assert_eq!(store.get_record("job").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_pop_max_into_moves_member() {
        let store = MemoryStore::new();
        store.zadd("waiting", "low", 1.0).await.unwrap();
        store.zadd("waiting", "high", 5.0).await.unwrap();

        let popped = store.zpop_max_into("waiting", "processing", 99.0).await.unwrap();
        assert_eq!(popped, Some(("high".into(), 5.0)));
        assert_eq!(store.zscore("processing", "high").await.unwrap(), Some(99.0));
        assert_eq!(store.zcard("waiting").await.unwrap(), 1);

        store.zpop_max_into("waiting", "processing", 99.0).await.unwrap();
        assert_eq!(store.zpop_max_into("waiting", "processing", 99.0).await.unwrap(), None);
        assert_eq!(store.zcard("processing").await.unwrap(), 2);
    }
}
