//! Persistent key/value storage.
//!
//! Every engine implements the three-operation [`KvStore`] contract. The
//! engine is chosen once at startup by [`Store::from_config`]; the rest of the
//! crate is generic over `KvStore` and never inspects which one it got.

use crate::config::StorageConfig;
use crate::error::Result;
use std::future::Future;

#[cfg(feature = "cockroach")]
pub mod cockroach;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "cockroach")]
pub use cockroach::CockroachStore;
pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Table shared by the SQL engines.
pub(crate) const TABLE: &str = "kv_store";

/// Uniform put/get/delete over a persistent medium.
///
/// Each call is atomic on its own; nothing spans keys or calls. `put` is an
/// upsert and `delete` of an absent key succeeds, so replaying either is a
/// no-op.
pub trait KvStore: Send + Sync + 'static {
    /// Engine name reported in health details.
    fn kind(&self) -> &'static str;

    /// Insert or replace the value stored under `key`.
    fn put(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;

    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Remove `key` if present.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

/// The engine selected by configuration.
pub enum Store {
    Memory(InMemoryStore),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteStore),
    #[cfg(feature = "cockroach")]
    Cockroach(CockroachStore),
}

impl Store {
    /// Build the configured engine. Connections are opened lazily.
    ///
    /// # Errors
    /// Returns `Error::Config` if the engine was not compiled in.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let store = match config {
            StorageConfig::Memory => Store::Memory(InMemoryStore::new()),
            #[cfg(feature = "sqlite")]
            StorageConfig::Sqlite { path } => Store::Sqlite(SqliteStore::new(path.clone())),
            #[cfg(feature = "cockroach")]
            StorageConfig::Cockroach { dsn, pool_size } => {
                Store::Cockroach(CockroachStore::new(dsn.clone(), *pool_size))
            }
            #[allow(unreachable_patterns)]
            other => {
                return Err(crate::error::Error::Config(format!(
                    "storage backend '{}' is not compiled in",
                    other.kind()
                )))
            }
        };
        info!("✓ Storage backend selected: {}", store.kind());
        Ok(store)
    }

    /// Release pooled connections, if the engine holds any.
    pub async fn close(&self) {
        match self {
            #[cfg(feature = "cockroach")]
            Store::Cockroach(store) => store.close().await,
            _ => {}
        }
    }
}

impl KvStore for Store {
    fn kind(&self) -> &'static str {
        match self {
            Store::Memory(s) => s.kind(),
            #[cfg(feature = "sqlite")]
            Store::Sqlite(s) => s.kind(),
            #[cfg(feature = "cockroach")]
            Store::Cockroach(s) => s.kind(),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        match self {
            Store::Memory(s) => s.put(key, value).await,
            #[cfg(feature = "sqlite")]
            Store::Sqlite(s) => s.put(key, value).await,
            #[cfg(feature = "cockroach")]
            Store::Cockroach(s) => s.put(key, value).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self {
            Store::Memory(s) => s.get(key).await,
            #[cfg(feature = "sqlite")]
            Store::Sqlite(s) => s.get(key).await,
            #[cfg(feature = "cockroach")]
            Store::Cockroach(s) => s.get(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            Store::Memory(s) => s.delete(key).await,
            #[cfg(feature = "sqlite")]
            Store::Sqlite(s) => s.delete(key).await,
            #[cfg(feature = "cockroach")]
            Store::Cockroach(s) => s.delete(key).await,
        }
    }
}
