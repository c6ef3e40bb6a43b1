//! # Tally Persistence
//!
//! Store adapters for the tally job queue.
//!
//! Supports:
//! - In-memory (for testing, re-exported from `tally-queue`)
//! - SQLite (for single-node, default feature)
//! - Redis (shared between processes, `redis` feature)

#[cfg(feature = "redis")]
pub mod redis_store;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;
use tally_queue::backend::{StoreAdapter, StoreError};
use tracing::debug;

pub use tally_queue::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConfig, SqliteStore};

/// Open the store a URL points at.
///
/// | URL                       | adapter       |
/// |---------------------------|---------------|
/// | `memory`                  | [`MemoryStore`] |
/// | `sqlite:...`              | `SqliteStore` |
/// | `redis://`, `rediss://`   | `RedisStore`  |
pub async fn open_store(url: &str) -> Result<Arc<dyn StoreAdapter>, StoreError> {
    debug!(url = %url, "Opening store");

    if url == "memory" || url == "memory://" {
        return Ok(Arc::new(MemoryStore::new()));
    }

    if url.starts_with("sqlite:") {
        #[cfg(feature = "sqlite")]
        return Ok(Arc::new(SqliteStore::connect(url).await?));
        #[cfg(not(feature = "sqlite"))]
        return Err(StoreError::Connection(
            "SQLite support not compiled in (enable the `sqlite` feature)".into(),
        ));
    }

    if url.starts_with("redis://") || url.starts_with("rediss://") {
        #[cfg(feature = "redis")]
        return Ok(Arc::new(RedisStore::connect(url).await?));
        #[cfg(not(feature = "redis"))]
        return Err(StoreError::Connection(
            "Redis support not compiled in (enable the `redis` feature)".into(),
        ));
    }

    Err(StoreError::Connection(format!(
        "Unsupported store URL: {}",
        url
    )))
}
