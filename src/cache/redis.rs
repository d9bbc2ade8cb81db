//! Redis cache backend implementation.

use super::CacheBackend;
use crate::error::{Error, Result};
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use std::time::Duration;

/// Default Redis connection pool size.
/// Formula: (CPU cores × 2) + 1
/// For 8-core systems: 16 connections is optimal
const DEFAULT_POOL_SIZE: u32 = 16;

/// Configuration for Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String, // e.g., "redis://redis:6379"
    pub connection_timeout: Duration,
    pub pool_size: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// Redis backend with connection pooling and async operations.
///
/// The pool is created up front but connections are opened on first use and
/// re-opened by the pool after failures, so building the backend never
/// touches the network.
///
/// # Example
///
/// ```no_run
/// # use deferred_kv::cache::{RedisCache, RedisConfig, CacheBackend};
/// # use deferred_kv::error::Result;
/// # async fn example() -> Result<()> {
/// let backend = RedisCache::new(RedisConfig {
///     url: "redis://localhost:6379".to_string(),
///     ..Default::default()
/// })?;
///
/// backend.set("key", "value", None).await?;
/// let value = backend.get("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
    timeout: Duration,
}

impl RedisCache {
    /// Create new Redis backend from configuration.
    ///
    /// # Errors
    /// Returns `Err` if connection pool creation fails
    pub fn new(config: RedisConfig) -> Result<Self> {
        let mut pool_config = Config::from_url(config.url.clone());
        pool_config.pool = Some(deadpool_redis::PoolConfig::new(config.pool_size as usize));

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Config(format!("Failed to create connection pool: {}", e)))?;

        info!(
            "✓ Redis backend initialized for {} (pool size: {})",
            config.url, config.pool_size
        );

        Ok(RedisCache {
            pool,
            timeout: config.connection_timeout,
        })
    }

    /// Close the pool; later commands fail.
    pub fn close(&self) {
        self.pool.close();
        info!("✓ Redis pool closed");
    }

    async fn conn(&self) -> Result<Connection> {
        match tokio::time::timeout(self.timeout, self.pool.get()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(Error::Cache(format!(
                "Failed to get Redis connection: {}",
                e
            ))),
            Err(_) => Err(Error::Timeout(self.timeout)),
        }
    }
}

/// Extract `used_memory` from the body of `INFO memory`.
fn parse_used_memory(info: &str) -> Option<u64> {
    info.lines()
        .find_map(|line| line.strip_prefix("used_memory:"))
        .and_then(|v| v.trim().parse().ok())
}

impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Cache(format!("Redis GET failed for key {}: {}", key, e)))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;

        let mut set = cmd("SET");
        set.arg(key).arg(value);
        if let Some(d) = ttl {
            set.arg("EX").arg(d.as_secs().max(1));
        }
        let _: () = set
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Cache(format!("Redis SET failed for key {}: {}", key, e)))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Cache(format!("Redis DEL failed for key {}: {}", key, e)))?;
        Ok(())
    }

    async fn dbsize(&self) -> Result<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = cmd("DBSIZE").query_async(&mut conn).await?;
        Ok(count)
    }

    async fn used_memory(&self) -> Result<u64> {
        let mut conn = self.conn().await?;
        let info: String = cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await?;
        Ok(parse_used_memory(&info).unwrap_or(0))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn configure_limits(&self, max_memory_bytes: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = cmd("CONFIG")
            .arg("SET")
            .arg("maxmemory")
            .arg(max_memory_bytes)
            .query_async(&mut conn)
            .await?;
        let _: () = cmd("CONFIG")
            .arg("SET")
            .arg("maxmemory-policy")
            .arg("allkeys-lru")
            .query_async(&mut conn)
            .await?;

        debug!(
            "✓ Redis CONFIG SET maxmemory {} (allkeys-lru)",
            max_memory_bytes
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_default() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.pool_size, 16);
    }

    #[test]
    fn test_parse_used_memory() {
        let info = "# Memory\r\nused_memory:1048576\r\nused_memory_human:1.00M\r\n";
        assert_eq!(parse_used_memory(info), Some(1_048_576));
        assert_eq!(parse_used_memory("# Memory\r\n"), None);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let cache = RedisCache::new(RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout: Duration::from_millis(500),
            pool_size: 1,
        })
        .expect("pool");

        assert!(cache.ping().await.is_err());
        assert!(cache.get("k").await.is_err());
    }
}
