//! Key-value coordinator access
//!
//! Everything the front end and the workers share lives in one Redis-compatible
//! store under the `autotest:` prefix. [`KvStore`] is the seam: production uses
//! [`RedisStore`], tests and single-process tooling use [`MemoryStore`].

pub mod keys;
pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::errors::AutotestError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub type SharedStore = Arc<dyn KvStore>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn ping(&self) -> Result<(), AutotestError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AutotestError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> Result<(), AutotestError>;
    /// Returns whether the key existed.
    async fn del(&self, key: &str) -> Result<bool, AutotestError>;
    async fn incr(&self, key: &str) -> Result<i64, AutotestError>;
    async fn expire(&self, key: &str, seconds: u64) -> Result<(), AutotestError>;

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, AutotestError>;
    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), AutotestError>;
    /// Returns whether the field was set.
    async fn hsetnx(&self, hash: &str, field: &str, value: &str) -> Result<bool, AutotestError>;
    async fn hdel(&self, hash: &str, field: &str) -> Result<(), AutotestError>;
    async fn hincr(&self, hash: &str, field: &str, delta: i64) -> Result<i64, AutotestError>;
    async fn hgetall(&self, hash: &str) -> Result<HashMap<String, String>, AutotestError>;

    async fn rpush(&self, list: &str, value: &str) -> Result<(), AutotestError>;
    /// Removes every occurrence of `value`, returning how many were removed.
    async fn lrem(&self, list: &str, value: &str) -> Result<i64, AutotestError>;
    async fn llen(&self, list: &str) -> Result<i64, AutotestError>;
    /// Pops the head of the first non-empty list, waiting up to `timeout`.
    async fn blpop(
        &self,
        lists: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, AutotestError>;

    async fn get_string(&self, key: &str) -> Result<Option<String>, AutotestError> {
        match self.get(key).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| AutotestError::ParsingError(format!("{} is not utf-8: {}", key, e))),
            None => Ok(None),
        }
    }
}

/// Connect to the store named by `url`. `memory://` yields an in-process store.
pub async fn connect(url: &str) -> Result<SharedStore, AutotestError> {
    if url.starts_with("memory://") {
        log::warn!("Using in-process key-value store; state is not shared between processes");
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(RedisStore::connect(url).await?))
}
