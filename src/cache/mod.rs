//! Best-effort cache in front of storage.
//!
//! [`CacheBackend`] is the raw command set of a cache service.
//! [`CacheClient`] wraps a backend with the policy the rest of the crate relies
//! on: lookups never fail (errors count as misses), writes are skipped once the
//! key-count ceiling is reached, and hit/miss/size telemetry is kept.

use crate::config::{CacheConfig, CacheEngine};
use crate::error::Result;
use crate::observability::Metrics;
use crate::policy::{self, Operation};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::{RedisCache, RedisConfig};

/// TTL for entries populated after a read miss.
pub const READ_FILL_TTL: Duration = Duration::from_secs(300);

/// One key-count sample is taken every this many `set` calls.
const SIZE_SAMPLE_EVERY: u64 = 10;

/// Commands a cache service must support.
pub trait CacheBackend: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Number of keys currently held.
    fn dbsize(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Bytes of memory used by the service.
    fn used_memory(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Round-trip check.
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;

    /// Push a memory ceiling and LRU eviction policy to the service.
    fn configure_limits(&self, max_memory_bytes: u64) -> impl Future<Output = Result<()>> + Send;
}

/// Telemetry snapshot returned by [`CacheClient::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub keys_count: u64,
    pub max_keys_limit: u64,
    pub memory_used_bytes: u64,
    pub max_memory_bytes: u64,
    /// Percentage of lookups that hit, 0 when nothing was looked up.
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
}

/// Cache backend wrapped with capacity policy and telemetry.
pub struct CacheClient<C: CacheBackend> {
    backend: C,
    max_keys: u64,
    max_memory_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    metrics: Arc<dyn Metrics>,
}

impl<C: CacheBackend> CacheClient<C> {
    pub fn new(backend: C, max_keys: u64, max_memory_bytes: u64, metrics: Arc<dyn Metrics>) -> Self {
        CacheClient {
            backend,
            max_keys,
            max_memory_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            metrics,
        }
    }

    /// Build a client from configuration limits.
    pub fn with_config(backend: C, config: &CacheConfig, metrics: Arc<dyn Metrics>) -> Self {
        Self::new(backend, config.max_keys, config.max_memory_bytes(), metrics)
    }

    /// Look up `key`. An unreachable cache is reported as a miss.
    pub async fn get(&self, key: &str) -> Option<String> {
        let found = policy::settle(Operation::CacheGet, self.backend.get(key).await)
            .ok()
            .flatten()
            .flatten();

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.cache_hit();
            debug!("✓ Cache GET {} -> HIT", key);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.metrics.cache_miss();
            debug!("✓ Cache GET {} -> MISS", key);
        }
        found
    }

    /// Store `value` under `key`, best effort.
    ///
    /// When the service already holds `max_keys` or more keys the write is
    /// skipped, not evicted for; freeing room is left to the service's own
    /// memory-based eviction. If the key count cannot be read the write is
    /// attempted regardless of the ceiling. A failed write is retried once.
    /// Failures are never returned.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let count = policy::settle(Operation::CacheSizeCheck, self.backend.dbsize().await)
            .ok()
            .flatten();

        match count {
            Some(n) if n >= self.max_keys => {
                debug!(
                    "Cache SET {} skipped: {} keys at or above ceiling {}",
                    key, n, self.max_keys
                );
            }
            _ => {
                let written = match self.backend.set(key, value, ttl).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("Cache SET {} failed ({}), retrying once", key, e);
                        policy::absorb(Operation::CacheSet, self.backend.set(key, value, ttl).await)
                    }
                };
                if written {
                    debug!("✓ Cache SET {} (TTL: {:?})", key, ttl);
                }
            }
        }

        // Sample the key count for the size gauge on a fraction of calls only.
        let call = self.sets.fetch_add(1, Ordering::Relaxed);
        if call % SIZE_SAMPLE_EVERY == 0 {
            if let Ok(keys) = self.backend.dbsize().await {
                self.metrics.cache_size(keys);
            }
        }
    }

    /// Remove `key`. Errors are returned; callers pick the policy.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await?;
        debug!("✓ Cache DELETE {}", key);
        Ok(())
    }

    /// Snapshot of cache telemetry.
    ///
    /// # Errors
    /// Returns `Error::Cache` when the service cannot be queried.
    pub async fn stats(&self) -> Result<CacheStats> {
        let memory_used_bytes = self.backend.used_memory().await?;
        let keys_count = self.backend.dbsize().await?;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_rate = if lookups > 0 {
            hits as f64 / lookups as f64 * 100.0
        } else {
            0.0
        };

        Ok(CacheStats {
            keys_count,
            max_keys_limit: self.max_keys,
            memory_used_bytes,
            max_memory_bytes: self.max_memory_bytes,
            hit_rate,
            hits,
            misses,
        })
    }

    /// Whether the service answers a ping.
    pub async fn ping(&self) -> bool {
        self.backend.ping().await.is_ok()
    }

    /// Push the memory ceiling to the service. A refusal is only logged.
    pub async fn configure_limits(&self) {
        match self.backend.configure_limits(self.max_memory_bytes).await {
            Ok(()) => info!(
                "✓ Cache limits applied: {} bytes, policy allkeys-lru",
                self.max_memory_bytes
            ),
            Err(e) => warn!("⚠ Could not apply cache limits: {}", e),
        }
    }

    pub fn max_keys(&self) -> u64 {
        self.max_keys
    }

    /// Get backend reference (for advanced use).
    pub fn backend(&self) -> &C {
        &self.backend
    }
}

/// The cache engine selected by configuration.
pub enum Cache {
    Memory(InMemoryCache),
    #[cfg(feature = "redis")]
    Redis(RedisCache),
}

impl Cache {
    /// Build the configured engine. No connection is made yet.
    ///
    /// # Errors
    /// Returns `Error::Config` if the engine was not compiled in or the pool
    /// cannot be built.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        match config.engine {
            CacheEngine::Memory => Ok(Cache::Memory(InMemoryCache::new())),
            #[cfg(feature = "redis")]
            CacheEngine::Redis => Ok(Cache::Redis(RedisCache::new(RedisConfig {
                url: config.url(),
                pool_size: config.pool_size,
                ..Default::default()
            })?)),
            #[cfg(not(feature = "redis"))]
            CacheEngine::Redis => Err(crate::error::Error::Config(
                "cache backend 'redis' is not compiled in".to_string(),
            )),
        }
    }

    /// Release pooled connections, if the engine holds any.
    pub fn close(&self) {
        match self {
            #[cfg(feature = "redis")]
            Cache::Redis(c) => c.close(),
            _ => {}
        }
    }
}

impl CacheBackend for Cache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self {
            Cache::Memory(c) => c.get(key).await,
            #[cfg(feature = "redis")]
            Cache::Redis(c) => c.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        match self {
            Cache::Memory(c) => c.set(key, value, ttl).await,
            #[cfg(feature = "redis")]
            Cache::Redis(c) => c.set(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            Cache::Memory(c) => c.delete(key).await,
            #[cfg(feature = "redis")]
            Cache::Redis(c) => c.delete(key).await,
        }
    }

    async fn dbsize(&self) -> Result<u64> {
        match self {
            Cache::Memory(c) => c.dbsize().await,
            #[cfg(feature = "redis")]
            Cache::Redis(c) => c.dbsize().await,
        }
    }

    async fn used_memory(&self) -> Result<u64> {
        match self {
            Cache::Memory(c) => c.used_memory().await,
            #[cfg(feature = "redis")]
            Cache::Redis(c) => c.used_memory().await,
        }
    }

    async fn ping(&self) -> Result<()> {
        match self {
            Cache::Memory(c) => c.ping().await,
            #[cfg(feature = "redis")]
            Cache::Redis(c) => c.ping().await,
        }
    }

    async fn configure_limits(&self, max_memory_bytes: u64) -> Result<()> {
        match self {
            Cache::Memory(c) => c.configure_limits(max_memory_bytes).await,
            #[cfg(feature = "redis")]
            Cache::Redis(c) => c.configure_limits(max_memory_bytes).await,
        }
    }
}
