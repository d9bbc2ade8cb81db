//! In-process cache backend.

use super::CacheBackend;
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

/// In-memory cache backend with per-entry TTL.
///
/// Expired entries are dropped lazily on access and before counting. There is
/// no eviction; the configured memory ceiling is only recorded.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    max_memory_bytes: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the service going away; every command fails until restored.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Memory ceiling last pushed through `configure_limits`, 0 if never.
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Cache("in-memory cache unavailable".to_string()));
        }
        Ok(())
    }

    fn purge_expired(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }
}

impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.ensure_available()?;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn dbsize(&self) -> Result<u64> {
        self.ensure_available()?;
        self.purge_expired();
        Ok(self.entries.len() as u64)
    }

    async fn used_memory(&self) -> Result<u64> {
        self.ensure_available()?;
        let bytes: usize = self
            .entries
            .iter()
            .map(|entry| entry.key().len() + entry.value().value.len())
            .sum();
        Ok(bytes as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_available()
    }

    async fn configure_limits(&self, max_memory_bytes: u64) -> Result<()> {
        self.ensure_available()?;
        self.max_memory_bytes
            .store(max_memory_bytes, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = InMemoryCache::new();
        cache.set("a", "1", None).await.expect("set");
        assert_eq!(cache.get("a").await.expect("get").as_deref(), Some("1"));
        cache.delete("a").await.expect("delete");
        assert_eq!(cache.get("a").await.expect("get"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = InMemoryCache::new();
        cache
            .set("a", "1", Some(Duration::from_secs(300)))
            .await
            .expect("set");
        cache.set("b", "2", None).await.expect("set");

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get("a").await.expect("get").as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("a").await.expect("get"), None);
        assert_eq!(cache.dbsize().await.expect("dbsize"), 1);
    }

    #[tokio::test]
    async fn test_used_memory_counts_keys_and_values() {
        let cache = InMemoryCache::new();
        cache.set("ab", "cde", None).await.expect("set");
        assert_eq!(cache.used_memory().await.expect("memory"), 5);
    }

    #[tokio::test]
    async fn test_configure_limits_is_recorded() {
        let cache = InMemoryCache::new();
        cache.configure_limits(4096).await.expect("limits");
        assert_eq!(cache.max_memory_bytes(), 4096);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let cache = InMemoryCache::new();
        cache.set_available(false);
        assert!(cache.ping().await.is_err());
        assert!(matches!(cache.get("a").await, Err(Error::Cache(_))));
        cache.set_available(true);
        assert!(cache.ping().await.is_ok());
    }
}
