//! SQLite store adapter

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use tally_queue::backend::{resolve_range, Batch, BatchGuard, StoreAdapter, StoreError, StoreOp};

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:tally.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:tally.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Create config for in-memory database (testing).
    ///
    /// Every connection to `sqlite::memory:` opens a fresh database, so the
    /// pool is pinned to a single connection.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }
}

fn query_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolClosed => StoreError::Closed,
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Connection(e.to_string()),
        other => StoreError::Query(other.to_string()),
    }
}

/// Store adapter over two tables: `records` for job bodies and
/// `sorted_sets` for the ordering indices.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let config = if url.contains(":memory:") {
            SqliteConfig {
                url: url.to_string(),
                ..SqliteConfig::memory()
            }
        } else {
            SqliteConfig::new(url)
        };
        Self::connect_with_config(config).await
    }

    pub async fn connect_with_config(config: SqliteConfig) -> Result<Self, StoreError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        options = options.pragma("busy_timeout", (config.busy_timeout_secs * 1000).to_string());
        if config.wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Query(format!("Migration failed: {}", e)))?;

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_op(
    conn: &mut sqlx::SqliteConnection,
    op: StoreOp,
    now: i64,
) -> Result<(), sqlx::Error> {
    match op {
        StoreOp::SetRecord { key, value } => {
            sqlx::query("INSERT OR REPLACE INTO records (key, value, updated_at) VALUES (?, ?, ?)")
                .bind(key)
                .bind(value)
                .bind(now)
                .execute(&mut *conn)
                .await?;
        }
        StoreOp::DeleteRecord { key } => {
            sqlx::query("DELETE FROM records WHERE key = ?")
                .bind(key)
                .execute(&mut *conn)
                .await?;
        }
        StoreOp::ZAdd { key, member, score } => {
            sqlx::query(
                "INSERT INTO sorted_sets (set_key, member, score) VALUES (?, ?, ?) \
                 ON CONFLICT (set_key, member) DO UPDATE SET score = excluded.score",
            )
            .bind(key)
            .bind(member)
            .bind(score)
            .execute(&mut *conn)
            .await?;
        }
        StoreOp::ZRem { key, member } => {
            sqlx::query("DELETE FROM sorted_sets WHERE set_key = ? AND member = ?")
                .bind(key)
                .bind(member)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

/// Checks a guard with a no-op write, which takes the write lock before the
/// condition is read.
async fn guard_holds(conn: &mut sqlx::SqliteConnection, guard: &BatchGuard) -> Result<bool, sqlx::Error> {
    let touched = match guard {
        BatchGuard::Member { key, member } => {
            sqlx::query("UPDATE sorted_sets SET score = score WHERE set_key = ? AND member = ?")
                .bind(key)
                .bind(member)
                .execute(&mut *conn)
                .await?
        }
        BatchGuard::Record { key, value } => {
            sqlx::query("UPDATE records SET value = value WHERE key = ? AND value = ?")
                .bind(key)
                .bind(value)
                .execute(&mut *conn)
                .await?
        }
    };
    Ok(touched.rows_affected() > 0)
}

async fn pop_max_row(
    conn: &mut sqlx::SqliteConnection,
    key: &str,
) -> Result<Option<(String, f64)>, sqlx::Error> {
    // Single statement, so selection and removal cannot interleave with
    // another pop.
    let row = sqlx::query(
        "DELETE FROM sorted_sets WHERE set_key = ?1 AND member = ( \
             SELECT member FROM sorted_sets WHERE set_key = ?1 \
             ORDER BY score DESC, member DESC LIMIT 1 \
         ) RETURNING member, score",
    )
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(Some((row.try_get("member")?, row.try_get("score")?))),
        None => Ok(None),
    }
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn is_healthy(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn get_record(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM records WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;

        row.map(|r| r.try_get::<String, _>("value").map_err(query_err)).transpose()
    }

    async fn set_record(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(query_err)?;
        apply_op(
            &mut conn,
            StoreOp::SetRecord {
                key: key.to_string(),
                value: value.to_string(),
            },
            chrono::Utc::now().timestamp_millis(),
        )
        .await
        .map_err(query_err)
    }

    async fn delete_record(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM records WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(query_err)?;
        apply_op(
            &mut conn,
            StoreOp::ZAdd {
                key: key.to_string(),
                member: member.to_string(),
                score,
            },
            0,
        )
        .await
        .map_err(query_err)
    }

    async fn zpop_max(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(query_err)?;
        pop_max_row(&mut conn, key).await.map_err(query_err)
    }

    async fn zpop_max_into(
        &self,
        src: &str,
        dst: &str,
        score: f64,
    ) -> Result<Option<(String, f64)>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        let Some((member, popped)) = pop_max_row(&mut tx, src).await.map_err(query_err)? else {
            tx.rollback().await.map_err(query_err)?;
            return Ok(None);
        };
        apply_op(
            &mut tx,
            StoreOp::ZAdd {
                key: dst.to_string(),
                member: member.clone(),
                score,
            },
            0,
        )
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(Some((member, popped)))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT member FROM sorted_sets WHERE set_key = ? AND score >= ? AND score <= ? \
             ORDER BY score ASC, member ASC",
        )
        .bind(key)
        .bind(min)
        .bind(max)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("member").map_err(query_err))
            .collect()
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let len = self.zcard(key).await?;
        let Some((start, stop)) = resolve_range(len, start, stop) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            "SELECT member FROM sorted_sets WHERE set_key = ? \
             ORDER BY score ASC, member ASC LIMIT ? OFFSET ?",
        )
        .bind(key)
        .bind((stop - start + 1) as i64)
        .bind(start as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("member").map_err(query_err))
            .collect()
    }

    async fn zrevrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, StoreError> {
        let len = self.zcard(key).await?;
        let Some((start, stop)) = resolve_range(len, start, stop) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            "SELECT member FROM sorted_sets WHERE set_key = ? \
             ORDER BY score DESC, member DESC LIMIT ? OFFSET ?",
        )
        .bind(key)
        .bind((stop - start + 1) as i64)
        .bind(start as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("member").map_err(query_err))
            .collect()
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let row = sqlx::query("SELECT score FROM sorted_sets WHERE set_key = ? AND member = ?")
            .bind(key)
            .bind(member)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;

        row.map(|r| r.try_get::<f64, _>("score").map_err(query_err)).transpose()
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sorted_sets WHERE set_key = ? AND member = ?")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sorted_sets WHERE set_key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(query_err)?;

        Ok(count as u64)
    }

    async fn exec_batch(&self, batch: Batch) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        let (guards, ops) = batch.into_parts();
        for guard in &guards {
            if !guard_holds(&mut tx, guard).await.map_err(query_err)? {
                debug!(?guard, "Batch guard not held, skipping");
                tx.rollback().await.map_err(query_err)?;
                return Ok(false);
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        for op in ops {
            apply_op(&mut tx, op, now).await.map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}
