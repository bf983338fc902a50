//! In-process [`KvStore`] with the same observable semantics as Redis for
//! the commands the service uses, including key expiry and blocking pops.

use super::KvStore;
use crate::errors::AutotestError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Default)]
struct State {
    strings: HashMap<String, Vec<u8>>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    expiry: HashMap<String, Instant>,
}

impl State {
    fn purge(&mut self, key: &str) {
        if let Some(deadline) = self.expiry.get(key) {
            if *deadline <= Instant::now() {
                self.expiry.remove(key);
                self.strings.remove(key);
                self.hashes.remove(key);
                self.lists.remove(key);
            }
        }
    }

    fn exists(&self, key: &str) -> bool {
        self.strings.contains_key(key) || self.hashes.contains_key(key) || self.lists.contains_key(key)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, key: &str) -> Result<MutexGuard<'_, State>, AutotestError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| AutotestError::KvUnavailable("memory store poisoned".to_string()))?;
        state.purge(key);
        Ok(state)
    }

    /// Remaining time to live of `key`, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let state = self.lock(key).ok()?;
        state
            .expiry
            .get(key)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn try_pop(&self, lists: &[String]) -> Result<Option<(String, String)>, AutotestError> {
        for list in lists {
            let mut state = self.lock(list)?;
            if let Some(queue) = state.lists.get_mut(list) {
                if let Some(value) = queue.pop_front() {
                    if queue.is_empty() {
                        state.lists.remove(list);
                    }
                    return Ok(Some((list.clone(), value)));
                }
            }
        }
        Ok(None)
    }
}

fn integer(bytes: &[u8]) -> Result<i64, AutotestError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AutotestError::KvUnavailable("value is not an integer".to_string()))
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn ping(&self) -> Result<(), AutotestError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AutotestError> {
        Ok(self.lock(key)?.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> Result<(), AutotestError> {
        let mut state = self.lock(key)?;
        state.strings.insert(key.to_string(), value.to_vec());
        match ttl {
            Some(seconds) => {
                state
                    .expiry
                    .insert(key.to_string(), Instant::now() + Duration::from_secs(seconds));
            }
            None => {
                state.expiry.remove(key);
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, AutotestError> {
        let mut state = self.lock(key)?;
        let existed = state.exists(key);
        state.strings.remove(key);
        state.hashes.remove(key);
        state.lists.remove(key);
        state.expiry.remove(key);
        Ok(existed)
    }

    async fn incr(&self, key: &str) -> Result<i64, AutotestError> {
        let mut state = self.lock(key)?;
        let next = match state.strings.get(key) {
            Some(bytes) => integer(bytes)? + 1,
            None => 1,
        };
        state.strings.insert(key.to_string(), next.to_string().into_bytes());
        Ok(next)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<(), AutotestError> {
        let mut state = self.lock(key)?;
        if state.exists(key) {
            state
                .expiry
                .insert(key.to_string(), Instant::now() + Duration::from_secs(seconds));
        }
        Ok(())
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, AutotestError> {
        let state = self.lock(hash)?;
        Ok(state.hashes.get(hash).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), AutotestError> {
        let mut state = self.lock(hash)?;
        state
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hsetnx(&self, hash: &str, field: &str, value: &str) -> Result<bool, AutotestError> {
        let mut state = self.lock(hash)?;
        let entry = state.hashes.entry(hash.to_string()).or_default();
        if entry.contains_key(field) {
            return Ok(false);
        }
        entry.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<(), AutotestError> {
        let mut state = self.lock(hash)?;
        if let Some(entry) = state.hashes.get_mut(hash) {
            entry.remove(field);
            if entry.is_empty() {
                state.hashes.remove(hash);
            }
        }
        Ok(())
    }

    async fn hincr(&self, hash: &str, field: &str, delta: i64) -> Result<i64, AutotestError> {
        let mut state = self.lock(hash)?;
        let entry = state.hashes.entry(hash.to_string()).or_default();
        let current = match entry.get(field) {
            Some(value) => integer(value.as_bytes())?,
            None => 0,
        };
        let next = current + delta;
        entry.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hgetall(&self, hash: &str) -> Result<HashMap<String, String>, AutotestError> {
        let state = self.lock(hash)?;
        Ok(state.hashes.get(hash).cloned().unwrap_or_default())
    }

    async fn rpush(&self, list: &str, value: &str) -> Result<(), AutotestError> {
        {
            let mut state = self.lock(list)?;
            state
                .lists
                .entry(list.to_string())
                .or_default()
                .push_back(value.to_string());
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn lrem(&self, list: &str, value: &str) -> Result<i64, AutotestError> {
        let mut state = self.lock(list)?;
        let Some(queue) = state.lists.get_mut(list) else {
            return Ok(0);
        };
        let before = queue.len();
        queue.retain(|v| v != value);
        let removed = (before - queue.len()) as i64;
        if queue.is_empty() {
            state.lists.remove(list);
        }
        Ok(removed)
    }

    async fn llen(&self, list: &str) -> Result<i64, AutotestError> {
        let state = self.lock(list)?;
        Ok(state.lists.get(list).map(|q| q.len() as i64).unwrap_or(0))
    }

    async fn blpop(
        &self,
        lists: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, AutotestError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            if let Some(popped) = self.try_pop(lists)? {
                return Ok(Some(popped));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Polling bound covers pushes racing the notification registration.
            let wait = remaining.min(Duration::from_millis(50));
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_incr_and_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("counter").await.unwrap(), 1);
        assert_eq!(store.incr("counter").await.unwrap(), 2);
        store.expire("counter", 0).await.unwrap();
        assert_eq!(store.get("counter").await.unwrap(), None);
        assert_eq!(store.incr("counter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_with_ttl() {
        let store = MemoryStore::new();
        store.set("k", b"v", Some(60)).await.unwrap();
        assert_eq!(store.get_string("k").await.unwrap().as_deref(), Some("v"));
        let ttl = store.ttl("k").unwrap();
        assert!(ttl <= Duration::from_secs(60) && ttl > Duration::from_secs(55));
        store.set("k", b"w", None).await.unwrap();
        assert!(store.ttl("k").is_none());
        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_commands() {
        let store = MemoryStore::new();
        assert!(store.hsetnx("h", "a", "1").await.unwrap());
        assert!(!store.hsetnx("h", "a", "2").await.unwrap());
        assert_eq!(store.hget("h", "a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.hincr("h", "n", 3).await.unwrap(), 3);
        assert_eq!(store.hincr("h", "n", 1).await.unwrap(), 4);
        store.hdel("h", "a").await.unwrap();
        let all = store.hgetall("h").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["n"], "4");
    }

    #[tokio::test]
    async fn test_blpop_respects_list_order() {
        let store = MemoryStore::new();
        store.rpush("low", "1").await.unwrap();
        store.rpush("high", "2").await.unwrap();
        store.rpush("high", "3").await.unwrap();
        let lists = vec!["high".to_string(), "low".to_string()];
        let timeout = Duration::from_millis(10);
        assert_eq!(
            store.blpop(&lists, timeout).await.unwrap(),
            Some(("high".to_string(), "2".to_string()))
        );
        assert_eq!(
            store.blpop(&lists, timeout).await.unwrap(),
            Some(("high".to_string(), "3".to_string()))
        );
        assert_eq!(
            store.blpop(&lists, timeout).await.unwrap(),
            Some(("low".to_string(), "1".to_string()))
        );
        assert_eq!(store.blpop(&lists, timeout).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blpop_wakes_on_push() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let pusher = store.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.rpush("q", "job").await.unwrap();
        });
        let popped = store
            .blpop(&["q".to_string()], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(popped, Some(("q".to_string(), "job".to_string())));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_lrem_removes_all_occurrences() {
        let store = MemoryStore::new();
        for value in ["a", "b", "a"] {
            store.rpush("l", value).await.unwrap();
        }
        assert_eq!(store.lrem("l", "a").await.unwrap(), 2);
        assert_eq!(store.llen("l").await.unwrap(), 1);
        assert_eq!(store.lrem("missing", "a").await.unwrap(), 0);
    }
}
