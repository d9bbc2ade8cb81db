//! # deferred-kv
//!
//! A key-value service that reads through a cache and defers every write to a
//! durable queue.
//!
//! ## Components
//!
//! - **Storage:** uniform put/get/delete over in-memory, SQLite or CockroachDB
//! - **Cache:** best-effort Redis (or in-memory) accelerator with a key-count ceiling
//! - **Queue:** at-least-once `add_key`/`del_key` intents over AMQP (or in-memory)
//! - **Applier:** drains both queues into storage and invalidates the cache
//! - **Health:** concurrent probes of all three subsystems
//! - **Gateway:** axum HTTP surface tying the above together
//!
//! A `PUT` is acknowledged once its intent is queued, not once it is applied.
//! Reads may therefore lag writes until the applier catches up.
//!
//! ## Quick Start
//!
//! ```ignore
//! use deferred_kv::{Config, Store, Cache, Broker, CacheClient, Gateway};
//!
//! let config = Config::from_env();
//! let store = Arc::new(Store::from_config(&config.storage)?);
//! let cache = Arc::new(CacheClient::with_config(
//!     Cache::from_config(&config.cache)?,
//!     &config.cache,
//!     metrics.clone(),
//! ));
//! let broker = Arc::new(Broker::from_config(&config.queue)?);
//!
//! let gateway = Gateway::new(store, cache, broker, tasks, metrics, config.probe_timeout);
//! let app = deferred_kv::gateway::router(Arc::new(gateway));
//! ```

#[macro_use]
extern crate log;

pub mod applier;
pub mod background;
pub mod cache;
pub mod config;
pub mod error;
pub mod expander;
pub mod gateway;
pub mod health;
pub mod observability;
pub mod policy;
pub mod queue;
pub mod storage;

// Re-exports for convenience
pub use applier::Applier;
pub use background::BackgroundTasks;
pub use cache::{Cache, CacheBackend, CacheClient};
pub use config::Config;
pub use error::{Error, Result};
pub use expander::CacheExpander;
pub use gateway::Gateway;
pub use health::HealthAggregator;
pub use observability::{InMemoryMetrics, Metrics, NoOpMetrics};
pub use queue::{Broker, Intent, MessageBroker, QueueProducer};
pub use storage::{KvStore, Store};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
