//! Replay protection for single-use values.

use std::sync::Arc;
use std::time::Duration;

use super::store::KeyValueStore;

/// Longest nonce accepted; bounds what an attacker can make us store.
const MAX_NONCE_LENGTH: usize = 128;

#[derive(Clone)]
pub struct NonceStore {
    store: Arc<dyn KeyValueStore>,
}

impl NonceStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Records `(scope_key, nonce)` and reports whether this is its first use
    /// within `ttl`. The check and the write are one atomic store operation.
    pub async fn check_and_record(
        &self,
        scope_key: &str,
        nonce: &str,
        ttl: Duration,
    ) -> Result<bool, anyhow::Error> {
        if nonce.is_empty() || nonce.len() > MAX_NONCE_LENGTH {
            return Ok(false);
        }

        let key = format!("nonce:{}:{}", scope_key, nonce);
        self.store.insert_if_absent(&key, "1", ttl).await
    }

    /// Drops expired entries from the backing store. The store is shared, so
    /// this also evicts expired idempotency, rate-limit and session keys.
    pub async fn sweep(&self) -> Result<usize, anyhow::Error> {
        self.store.sweep().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use crate::services::store::MemoryStore;

    fn nonce_store() -> (NonceStore, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        (NonceStore::new(store), clock)
    }

    #[tokio::test]
    async fn test_second_use_is_replay() {
        let (nonces, _) = nonce_store();
        let ttl = Duration::from_secs(120);
        assert!(nonces.check_and_record("sso", "n-1", ttl).await.unwrap());
        assert!(!nonces.check_and_record("sso", "n-1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let (nonces, _) = nonce_store();
        let ttl = Duration::from_secs(120);
        assert!(nonces.check_and_record("key-a", "n-1", ttl).await.unwrap());
        assert!(nonces.check_and_record("key-b", "n-1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_nonce_fresh_again_after_ttl() {
        let (nonces, clock) = nonce_store();
        let ttl = Duration::from_secs(120);
        assert!(nonces.check_and_record("sso", "n-1", ttl).await.unwrap());
        clock.advance(chrono::Duration::seconds(121));
        assert!(nonces.check_and_record("sso", "n-1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (nonces, clock) = nonce_store();
        nonces
            .check_and_record("sso", "short", Duration::from_secs(10))
            .await
            .unwrap();
        nonces
            .check_and_record("sso", "long", Duration::from_secs(600))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(11));

        assert_eq!(nonces.sweep().await.unwrap(), 1);
        assert!(!nonces
            .check_and_record("sso", "long", Duration::from_secs(600))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_rejects_empty_and_oversized() {
        let (nonces, _) = nonce_store();
        let ttl = Duration::from_secs(120);
        assert!(!nonces.check_and_record("sso", "", ttl).await.unwrap());
        let long = "x".repeat(MAX_NONCE_LENGTH + 1);
        assert!(!nonces.check_and_record("sso", &long, ttl).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_single_winner() {
        let (nonces, _) = nonce_store();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let nonces = nonces.clone();
            handles.push(tokio::spawn(async move {
                nonces
                    .check_and_record("sso", "shared", Duration::from_secs(120))
                    .await
                    .unwrap()
            }));
        }
        let mut fresh = 0;
        for handle in handles {
            if handle.await.unwrap() {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
    }
}
