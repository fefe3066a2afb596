//! TTL key-value storage behind the nonce, idempotency, rate-limit and
//! session stores.
//!
//! Every mutation that decides an outcome (`insert_if_absent`,
//! `compare_and_swap`) is a single atomic step in each backend, so callers
//! never need a separate check-then-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use redis::{aio::ConnectionManager, Client, Script};
use std::sync::Arc;
use std::time::Duration;

use super::clock::Clock;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Writes `value` only if `key` is absent or expired. Returns `true` when written.
    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error>;

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), anyhow::Error>;

    /// Replaces the value only if it currently equals `expected`. Returns `true` when swapped.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error>;

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error>;

    /// Deletes the key only if it currently holds `expected`. Returns `true` when deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, anyhow::Error>;

    /// Drops expired entries and returns how many were removed.
    async fn sweep(&self) -> Result<usize, anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

fn ttl_to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process backend. Atomicity comes from the per-shard locks of `DashMap`.
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn stored(&self, value: &str, ttl: Duration, now: DateTime<Utc>) -> StoredValue {
        StoredValue {
            value: value.to_string(),
            expires_at: now + ttl_to_chrono(ttl),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Ok(false);
                }
                occupied.insert(self.stored(value, ttl, now));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.stored(value, ttl, now));
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let now = self.clock.now();
        let found = self
            .entries
            .get(key)
            .map(|e| (e.value.clone(), e.expires_at));

        match found {
            Some((value, expires_at)) if expires_at > now => Ok(Some(value)),
            Some(_) => {
                self.entries.remove_if(key, |_, v| v.expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), anyhow::Error> {
        let now = self.clock.now();
        self.entries
            .insert(key.to_string(), self.stored(value, ttl, now));
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error> {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.expires_at > now && entry.value == expected => {
                *entry = self.stored(new, ttl, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        self.entries.remove(key);
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, anyhow::Error> {
        Ok(self.entries.remove_if(key, |_, v| v.value == expected).is_some())
    }

    async fn sweep(&self) -> Result<usize, anyhow::Error> {
        let now = self.clock.now();
        let mut removed = 0;
        // retain locks one shard at a time, request-path calls on other shards proceed.
        self.entries.retain(|_, v| {
            let keep = v.expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

const COMPARE_AND_SWAP_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
"#;

const COMPARE_AND_DELETE_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis backend. Expiry is native (`PX`), so `sweep` has nothing to do.
#[derive(Clone)]
pub struct RedisStore {
    _client: Client,
    manager: ConnectionManager,
    cas_script: Arc<Script>,
    cad_script: Arc<Script>,
}

impl RedisStore {
    pub async fn new(url: &str) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(url)?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
            cas_script: Arc::new(Script::new(COMPARE_AND_SWAP_LUA)),
            cad_script: Arc::new(Script::new(COMPARE_AND_DELETE_LUA)),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to insert {}: {}", key, e))?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", key, e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", key, e))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let swapped: i64 = self
            .cas_script
            .key(key)
            .arg(expected)
            .arg(new)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to swap {}: {}", key, e))?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete {}: {}", key, e))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let deleted: i64 = self
            .cad_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete {}: {}", key, e))?;
        Ok(deleted == 1)
    }

    async fn sweep(&self) -> Result<usize, anyhow::Error> {
        Ok(0)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::default();
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_insert_if_absent_rejects_live_key() {
        let (store, _) = store();
        let ttl = Duration::from_secs(60);
        assert!(store.insert_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.insert_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_expired_entry_counts_as_absent() {
        let (store, clock) = store();
        store
            .insert_if_absent("k", "a", Duration::from_secs(10))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(11));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store
            .insert_if_absent("k", "b", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let (store, _) = store();
        let ttl = Duration::from_secs(60);
        store.set("k", "v1", ttl).await.unwrap();
        assert!(!store.compare_and_swap("k", "other", "v2", ttl).await.unwrap());
        assert!(store.compare_and_swap("k", "v1", "v2", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
        assert!(!store.compare_and_swap("missing", "v1", "v2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete_requires_match() {
        let (store, _) = store();
        store.set("k", "mine", Duration::from_secs(60)).await.unwrap();
        assert!(!store.compare_and_delete("k", "theirs").await.unwrap());
        assert!(store.compare_and_delete("k", "mine").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (store, clock) = store();
        store.set("short", "x", Duration::from_secs(5)).await.unwrap();
        store.set("long", "y", Duration::from_secs(500)).await.unwrap();
        clock.advance(chrono::Duration::seconds(6));
        assert_eq!(store.sweep().await.unwrap(), 1);
        assert_eq!(store.entries.len(), 1);
        assert_eq!(store.get("long").await.unwrap().as_deref(), Some("y"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_insert_has_single_winner() {
        let (store, _) = store();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_if_absent("race", &i.to_string(), Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
