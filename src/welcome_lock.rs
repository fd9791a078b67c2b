//! Short-TTL distributed lock used by chatbot logic to avoid double-firing a
//! greeting flow for the same conversation.

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Minimal surface of the external key-value cache.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Atomic set-if-absent with expiry. Returns true when the key was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: u64)
    -> Result<bool, anyhow::Error>;
    async fn delete(&self, key: &str) -> Result<(), anyhow::Error>;
}

/// Mutual exclusion per ticket id, backed by the external cache. Acquisition
/// fails open when the cache is unreachable: a duplicate greeting is cheaper
/// than a stalled conversation.
pub struct WelcomeFlowLock {
    cache: Arc<dyn CacheClient>,
}

impl WelcomeFlowLock {
    pub fn new(cache: Arc<dyn CacheClient>) -> Self {
        Self { cache }
    }

    fn key(ticket_id: i64) -> String {
        format!("flow:lock:welcome:{ticket_id}")
    }

    pub async fn acquire(&self, ticket_id: i64, ttl_secs: u64) -> bool {
        let key = Self::key(ticket_id);
        match self.cache.set_if_absent(&key, "1", ttl_secs).await {
            Ok(acquired) => {
                debug!(target: "Wbot/WelcomeLock", "{key}: acquire -> {acquired}");
                acquired
            }
            Err(e) => {
                warn!(target: "Wbot/WelcomeLock", "{key}: cache unavailable, failing open: {e}");
                true
            }
        }
    }

    pub async fn release(&self, ticket_id: i64) {
        let key = Self::key(ticket_id);
        if let Err(e) = self.cache.delete(&key).await {
            warn!(target: "Wbot/WelcomeLock", "{key}: release failed, entry will expire: {e}");
        }
    }
}

/// In-process [`CacheClient`] with per-key expiry, for tests and
/// single-process deployments.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Instant>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    async fn set_if_absent(
        &self,
        key: &str,
        _value: &str,
        ttl_secs: u64,
    ) -> Result<bool, anyhow::Error> {
        let now = Instant::now();
        let expiry = now + Duration::from_secs(ttl_secs);
        let mut acquired = false;
        let entry = self
            .entries
            .entry(key.to_string())
            .and_modify(|current| {
                if *current <= now {
                    *current = expiry;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                expiry
            });
        drop(entry);
        Ok(acquired)
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use tokio::time::sleep;

    struct UnreachableCache;

    #[async_trait]
    impl CacheClient for UnreachableCache {
        async fn set_if_absent(&self, _: &str, _: &str, _: u64) -> Result<bool, anyhow::Error> {
            Err(anyhow!("connection refused"))
        }
        async fn delete(&self, _: &str) -> Result<(), anyhow::Error> {
            Err(anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_then_fails_open() {
        let lock = WelcomeFlowLock::new(Arc::new(MemoryCache::new()));
        assert!(lock.acquire(42, 8).await);
        assert!(!lock.acquire(42, 8).await);

        // Cache outage: fail open rather than blocking the flow.
        let lock = WelcomeFlowLock::new(Arc::new(UnreachableCache));
        assert!(lock.acquire(42, 8).await);
    }

    #[tokio::test]
    async fn test_release_frees_the_ticket() {
        let lock = WelcomeFlowLock::new(Arc::new(MemoryCache::new()));
        assert!(lock.acquire(7, 8).await);
        lock.release(7).await;
        assert!(lock.acquire(7, 8).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let lock = WelcomeFlowLock::new(Arc::new(MemoryCache::new()));
        assert!(lock.acquire(9, 2).await);
        assert!(!lock.acquire(9, 2).await);
        sleep(Duration::from_secs(3)).await;
        assert!(lock.acquire(9, 2).await);
    }

    #[tokio::test]
    async fn test_locks_are_per_ticket() {
        let lock = WelcomeFlowLock::new(Arc::new(MemoryCache::new()));
        assert!(lock.acquire(1, 8).await);
        assert!(lock.acquire(2, 8).await);
    }

    #[tokio::test]
    async fn test_release_on_unreachable_cache_is_best_effort() {
        let lock = WelcomeFlowLock::new(Arc::new(UnreachableCache));
        lock.release(1).await;
    }
}
