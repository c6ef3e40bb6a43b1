//! Redis store adapter
//!
//! Keeps the layout existing producers and dashboards read: job bodies are
//! hashes with a single `data` field, indices are native sorted sets.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use tally_queue::backend::{Batch, BatchGuard, StoreAdapter, StoreError, StoreOp};

const BODY_FIELD: &str = "data";

/// Applies a batch atomically.
///
/// KEYS: one per guard, then one per op, in order. ARGV: the guard count,
/// `kind, value` per guard, then each op name followed by its non-key args.
const BATCH_SCRIPT: &str = r#"
local k = 1
local a = 2
for _ = 1, tonumber(ARGV[1]) do
  local kind = ARGV[a]
  if kind == 'member' then
    if redis.call('ZSCORE', KEYS[k], ARGV[a + 1]) == false then
      return 0
    end
  elseif kind == 'record' then
    if redis.call('HGET', KEYS[k], 'data') ~= ARGV[a + 1] then
      return 0
    end
  else
    return redis.error_reply('unknown batch guard: ' .. kind)
  end
  k = k + 1
  a = a + 2
end
while a <= #ARGV do
  local op = ARGV[a]
  if op == 'set' then
    redis.call('HSET', KEYS[k], 'data', ARGV[a + 1])
    a = a + 2
  elseif op == 'del' then
    redis.call('DEL', KEYS[k])
    a = a + 1
  elseif op == 'zadd' then
    redis.call('ZADD', KEYS[k], ARGV[a + 2], ARGV[a + 1])
    a = a + 3
  elseif op == 'zrem' then
    redis.call('ZREM', KEYS[k], ARGV[a + 1])
    a = a + 2
  else
    return redis.error_reply('unknown batch op: ' .. op)
  end
  k = k + 1
end
return 1
"#;

/// KEYS: source, destination. ARGV: destination score.
const POP_INTO_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMAX', KEYS[1])
if #popped == 0 then
  return {}
end
redis.call('ZADD', KEYS[2], ARGV[1], popped[1])
return popped
"#;

fn redis_err(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
    {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Query(e.to_string())
    }
}

/// Store adapter over a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    batch_script: Script,
    pop_into_script: Script,
    closed: std::sync::Arc<AtomicBool>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!("Connected to Redis");
        Ok(Self::from_connection(redis))
    }

    /// Share an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            batch_script: Script::new(BATCH_SCRIPT),
            pop_into_script: Script::new(POP_INTO_SCRIPT),
            closed: std::sync::Arc::new(AtomicBool::new(false)),
        }
    }

    fn conn(&self) -> Result<ConnectionManager, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(self.redis.clone())
    }
}

/// Split a batch into the script's `KEYS` and `ARGV`.
fn encode_batch(batch: Batch) -> (Vec<String>, Vec<String>) {
    let (guards, ops) = batch.into_parts();
    let mut keys = Vec::with_capacity(guards.len() + ops.len());
    let mut args = Vec::with_capacity(1 + guards.len() * 2 + ops.len() * 3);

    args.push(guards.len().to_string());
    for guard in guards {
        match guard {
            BatchGuard::Member { key, member } => {
                keys.push(key);
                args.extend(["member".to_string(), member]);
            }
            BatchGuard::Record { key, value } => {
                keys.push(key);
                args.extend(["record".to_string(), value]);
            }
        }
    }

    for op in ops {
        match op {
            StoreOp::SetRecord { key, value } => {
                keys.push(key);
                args.extend(["set".to_string(), value]);
            }
            StoreOp::DeleteRecord { key } => {
                keys.push(key);
                args.push("del".to_string());
            }
            StoreOp::ZAdd { key, member, score } => {
                keys.push(key);
                args.extend(["zadd".to_string(), member, score.to_string()]);
            }
            StoreOp::ZRem { key, member } => {
                keys.push(key);
                args.extend(["zrem".to_string(), member]);
            }
        }
    }
    (keys, args)
}

/// Parse a `[member, score]` pop reply.
fn parse_popped(reply: Vec<String>) -> Result<Option<(String, f64)>, StoreError> {
    match reply.as_slice() {
        [] => Ok(None),
        [member, score] => {
            let score = score
                .parse()
                .map_err(|_| StoreError::Query(format!("non-numeric score: {}", score)))?;
            Ok(Some((member.clone(), score)))
        }
        other => Err(StoreError::Query(format!(
            "unexpected pop reply of {} elements",
            other.len()
        ))),
    }
}

#[async_trait]
impl StoreAdapter for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn is_healthy(&self) -> bool {
        let Ok(mut conn) = self.conn() else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }

    async fn get_record(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn()?;
        conn.hget(key, BODY_FIELD).await.map_err(redis_err)
    }

    async fn set_record(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.hset::<_, _, _, ()>(key, BODY_FIELD, value)
            .await
            .map_err(redis_err)
    }

    async fn delete_record(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.del(key).await.map_err(redis_err)?;
        Ok(removed > 0)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(redis_err)
    }

    async fn zpop_max(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        let mut conn = self.conn()?;
        let reply: Vec<String> = redis::cmd("ZPOPMAX")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        parse_popped(reply)
    }

    async fn zpop_max_into(
        &self,
        src: &str,
        dst: &str,
        score: f64,
    ) -> Result<Option<(String, f64)>, StoreError> {
        let mut conn = self.conn()?;
        let reply: Vec<String> = self
            .pop_into_script
            .key(src)
            .key(dst)
            .arg(score)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        parse_popped(reply)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn()?;
        conn.zrangebyscore(key, min, max).await.map_err(redis_err)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn()?;
        conn.zrange(key, start as isize, stop as isize)
            .await
            .map_err(redis_err)
    }

    async fn zrevrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn()?;
        conn.zrevrange(key, start as isize, stop as isize)
            .await
            .map_err(redis_err)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let mut conn = self.conn()?;
        conn.zscore(key, member).await.map_err(redis_err)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.zrem(key, member).await.map_err(redis_err)?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn()?;
        conn.zcard(key).await.map_err(redis_err)
    }

    async fn exec_batch(&self, batch: Batch) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let (keys, args) = encode_batch(batch);

        let mut invocation = self.batch_script.prepare_invoke();
        invocation.key(keys).arg(args);

        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(applied == 1)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        info!("Redis store closed");
        Ok(())
    }
}
