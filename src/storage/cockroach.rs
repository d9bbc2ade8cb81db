//! Distributed-SQL storage on CockroachDB (PostgreSQL wire protocol).

use super::{KvStore, TABLE};
use crate::error::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tokio::sync::OnceCell;

/// CockroachDB storage with a lazily created, shared connection pool.
///
/// The pool is created (and the schema ensured) by the first operation.
/// Concurrent first callers wait on the same initialisation instead of each
/// opening a pool. A failed initialisation fails that call only; the next call
/// tries again.
pub struct CockroachStore {
    dsn: String,
    pool_size: u32,
    pool: OnceCell<PgPool>,
}

impl CockroachStore {
    pub fn new(dsn: impl Into<String>, pool_size: u32) -> Self {
        CockroachStore {
            dsn: dsn.into(),
            pool_size,
            pool: OnceCell::new(),
        }
    }

    async fn pool(&self) -> Result<&PgPool> {
        self.pool
            .get_or_try_init(|| async {
                let pool = PgPoolOptions::new()
                    .max_connections(self.pool_size)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(&self.dsn)
                    .await
                    .map_err(|e| {
                        Error::Storage(format!("Failed to create connection pool: {}", e))
                    })?;

                sqlx::query(&format!(
                    "CREATE TABLE IF NOT EXISTS {} (key STRING PRIMARY KEY, value STRING)",
                    TABLE
                ))
                .execute(&pool)
                .await?;

                info!(
                    "✓ CockroachDB pool initialized (pool size: {})",
                    self.pool_size
                );
                Ok(pool)
            })
            .await
    }

    /// Close the pool if it was ever opened.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            info!("✓ CockroachDB pool closed");
        }
    }
}

impl KvStore for CockroachStore {
    fn kind(&self) -> &'static str {
        "cockroach"
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let pool = self.pool().await?;
        sqlx::query(&format!(
            "UPSERT INTO {} (key, value) VALUES ($1, $2)",
            TABLE
        ))
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;

        debug!("✓ CockroachDB UPSERT {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let pool = self.pool().await?;
        let value: Option<Option<String>> =
            sqlx::query_scalar(&format!("SELECT value FROM {} WHERE key = $1", TABLE))
                .bind(key)
                .fetch_optional(pool)
                .await?;
        Ok(value.flatten())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let pool = self.pool().await?;
        sqlx::query(&format!("DELETE FROM {} WHERE key = $1", TABLE))
            .bind(key)
            .execute(pool)
            .await?;

        debug!("✓ CockroachDB DELETE {}", key);
        Ok(())
    }
}
