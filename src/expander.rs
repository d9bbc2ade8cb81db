//! Cache-aside read path.

use crate::background::BackgroundTasks;
use crate::cache::{CacheBackend, CacheClient, READ_FILL_TTL};
use crate::error::Result;
use crate::observability::Metrics;
use crate::policy::{self, Operation};
use crate::storage::KvStore;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cache,
    Database,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Cache => write!(f, "cache"),
            Source::Database => write!(f, "database"),
        }
    }
}

/// A value found by [`CacheExpander::get`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lookup {
    pub value: String,
    pub source: Source,
}

/// Reads through the cache to storage and keeps the cache warm.
///
/// A cache miss falls back to storage; a storage hit is copied into the cache
/// in the background with [`READ_FILL_TTL`], so the response never waits on
/// the cache write. Cache failures only make reads slower. A storage failure
/// after a miss is returned, since nothing else can answer.
///
/// # Example
///
/// ```ignore
/// let expander = CacheExpander::new(store, cache, tasks, metrics);
/// match expander.get("a").await? {
///     Some(hit) => println!("{} from {}", hit.value, hit.source),
///     None => println!("not found"),
/// }
/// ```
pub struct CacheExpander<S: KvStore, C: CacheBackend> {
    store: Arc<S>,
    cache: Arc<CacheClient<C>>,
    tasks: BackgroundTasks,
    metrics: Arc<dyn Metrics>,
}

impl<S: KvStore, C: CacheBackend> CacheExpander<S, C> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<CacheClient<C>>,
        tasks: BackgroundTasks,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        CacheExpander {
            store,
            cache,
            tasks,
            metrics,
        }
    }

    /// Look up `key`, cache first.
    ///
    /// # Errors
    /// Returns `Error::Storage` when the cache missed and storage failed.
    pub async fn get(&self, key: &str) -> Result<Option<Lookup>> {
        if let Some(value) = self.cache.get(key).await {
            return Ok(Some(Lookup {
                value,
                source: Source::Cache,
            }));
        }

        let timer = Instant::now();
        let stored = policy::settle(Operation::StorageRead, self.store.get(key).await)?.flatten();
        self.metrics.storage_latency("get", timer.elapsed());

        match stored {
            Some(value) => {
                debug!("✓ {} GET {} -> HIT", self.store.kind(), key);
                self.fill(key, &value);
                Ok(Some(Lookup {
                    value,
                    source: Source::Database,
                }))
            }
            None => {
                debug!("{} GET {} -> MISS", self.store.kind(), key);
                Ok(None)
            }
        }
    }

    /// Drop `key` from the cache in the background.
    pub fn invalidate(&self, key: &str) {
        let cache = self.cache.clone();
        let key = key.to_string();
        self.tasks.spawn("cache invalidation", async move {
            policy::absorb(Operation::CacheInvalidate, cache.delete(&key).await);
            Ok(())
        });
    }

    fn fill(&self, key: &str, value: &str) {
        let cache = self.cache.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.tasks.spawn("cache fill", async move {
            cache.set(&key, &value, Some(READ_FILL_TTL)).await;
            Ok(())
        });
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CacheClient<C>> {
        &self.cache
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::error::Error;
    use crate::observability::InMemoryMetrics;
    use crate::storage::InMemoryStore;

    struct Fixture {
        store: InMemoryStore,
        cache: InMemoryCache,
        metrics: Arc<InMemoryMetrics>,
        expander: CacheExpander<InMemoryStore, InMemoryCache>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let cache = InMemoryCache::new();
        let metrics = Arc::new(InMemoryMetrics::new());
        let client = Arc::new(CacheClient::new(cache.clone(), 100, 1 << 20, metrics.clone()));
        let expander = CacheExpander::new(
            Arc::new(store.clone()),
            client,
            BackgroundTasks::new(8),
            metrics.clone(),
        );
        Fixture {
            store,
            cache,
            metrics,
            expander,
        }
    }

    #[tokio::test]
    async fn test_read_through_then_cache() {
        let f = fixture();
        f.store.put("a", "1").await.expect("put");

        let first = f.expander.get("a").await.expect("get").expect("found");
        assert_eq!(first.value, "1");
        assert_eq!(first.source, Source::Database);

        f.expander.tasks().wait_idle().await;

        let second = f.expander.get("a").await.expect("get").expect("found");
        assert_eq!(second.value, "1");
        assert_eq!(second.source, Source::Cache);

        assert_eq!(f.metrics.counter("kv_cache_miss_total"), 1);
        assert_eq!(f.metrics.counter("kv_cache_hit_total"), 1);
        assert_eq!(f.metrics.counter("kv_db_operation_latency_seconds_count{get}"), 1);
    }

    #[tokio::test]
    async fn test_absent_everywhere() {
        let f = fixture();
        assert_eq!(f.expander.get("missing").await.expect("get"), None);
        f.expander.tasks().wait_idle().await;
        assert_eq!(f.cache.dbsize().await.expect("dbsize"), 0);
    }

    #[tokio::test]
    async fn test_cache_outage_degrades_to_storage() {
        let f = fixture();
        f.store.put("a", "1").await.expect("put");
        f.cache.set_available(false);

        let hit = f.expander.get("a").await.expect("get").expect("found");
        assert_eq!(hit.source, Source::Database);
        f.expander.tasks().wait_idle().await;
    }

    #[tokio::test]
    async fn test_storage_failure_after_miss_is_returned() {
        let f = fixture();
        f.store.set_available(false);
        assert!(matches!(f.expander.get("a").await, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn test_storage_failure_hidden_by_cache_hit() {
        let f = fixture();
        f.cache.set("a", "cached", None).await.expect("set");
        f.store.set_available(false);

        let hit = f.expander.get("a").await.expect("get").expect("found");
        assert_eq!(hit.value, "cached");
        assert_eq!(hit.source, Source::Cache);
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let f = fixture();
        f.cache.set("a", "stale", None).await.expect("set");

        f.expander.invalidate("a");
        f.expander.tasks().wait_idle().await;
        assert_eq!(f.cache.get("a").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_invalidate_with_cache_down_is_silent() {
        let f = fixture();
        f.cache.set_available(false);
        f.expander.invalidate("a");
        f.expander.tasks().wait_idle().await;
    }

    #[test]
    fn test_source_serializes_lowercase() {
        let lookup = Lookup {
            value: "v".to_string(),
            source: Source::Database,
        };
        assert_eq!(
            serde_json::to_value(&lookup).expect("json"),
            serde_json::json!({"value": "v", "source": "database"})
        );
    }
}
