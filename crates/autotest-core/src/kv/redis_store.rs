use super::KvStore;
use crate::errors::AutotestError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;

/// Redis-backed store sharing one multiplexed connection manager.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, AutotestError> {
        let client = Client::open(url).map_err(|e| {
            AutotestError::KvUnavailable(format!("Invalid redis url {}: {}", url, e))
        })?;
        let manager = ConnectionManager::new(client).await.map_err(|e| {
            AutotestError::KvUnavailable(format!("Cannot connect to redis at {}: {}", url, e))
        })?;
        log::info!("Redis connection established");
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> Result<(), AutotestError> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AutotestError> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> Result<(), AutotestError> {
        let mut conn = self.conn();
        match ttl {
            Some(seconds) => conn.set_ex::<_, _, ()>(key, value, seconds).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, AutotestError> {
        let mut conn = self.conn();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64, AutotestError> {
        let mut conn = self.conn();
        Ok(conn.incr(key, 1).await?)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<(), AutotestError> {
        let mut conn = self.conn();
        let _: bool = conn.expire(key, seconds as i64).await?;
        Ok(())
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, AutotestError> {
        let mut conn = self.conn();
        Ok(conn.hget(hash, field).await?)
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), AutotestError> {
        let mut conn = self.conn();
        conn.hset::<_, _, _, ()>(hash, field, value).await?;
        Ok(())
    }

    async fn hsetnx(&self, hash: &str, field: &str, value: &str) -> Result<bool, AutotestError> {
        let mut conn = self.conn();
        Ok(conn.hset_nx(hash, field, value).await?)
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<(), AutotestError> {
        let mut conn = self.conn();
        conn.hdel::<_, _, ()>(hash, field).await?;
        Ok(())
    }

    async fn hincr(&self, hash: &str, field: &str, delta: i64) -> Result<i64, AutotestError> {
        let mut conn = self.conn();
        Ok(conn.hincr(hash, field, delta).await?)
    }

    async fn hgetall(&self, hash: &str) -> Result<HashMap<String, String>, AutotestError> {
        let mut conn = self.conn();
        Ok(conn.hgetall(hash).await?)
    }

    async fn rpush(&self, list: &str, value: &str) -> Result<(), AutotestError> {
        let mut conn = self.conn();
        conn.rpush::<_, _, ()>(list, value).await?;
        Ok(())
    }

    async fn lrem(&self, list: &str, value: &str) -> Result<i64, AutotestError> {
        let mut conn = self.conn();
        Ok(conn.lrem(list, 0, value).await?)
    }

    async fn llen(&self, list: &str) -> Result<i64, AutotestError> {
        let mut conn = self.conn();
        Ok(conn.llen(list).await?)
    }

    async fn blpop(
        &self,
        lists: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, AutotestError> {
        let mut conn = self.conn();
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(lists)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(popped)
    }
}
