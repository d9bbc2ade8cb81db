//! Composite health of storage, cache and queue.

use crate::cache::{CacheBackend, CacheClient};
use crate::error::Result;
use crate::queue::MessageBroker;
use crate::storage::KvStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Reserved key written and removed by the storage probe.
pub const PROBE_KEY: &str = "_health_probe";
const PROBE_VALUE: &str = "_ok";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

impl HealthStatus {
    fn from_bool(ok: bool) -> Self {
        if ok {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComponentDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_write_test: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_type: Option<&'static str>,
    pub details: ComponentDetails,
}

impl ComponentHealth {
    fn connection(ok: bool) -> Self {
        ComponentHealth {
            status: HealthStatus::from_bool(ok),
            backend_type: None,
            details: ComponentDetails {
                connection: Some(ok),
                ..Default::default()
            },
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Components {
    pub storage: ComponentHealth,
    pub cache: ComponentHealth,
    pub message_queue: ComponentHealth,
}

/// Result of [`HealthAggregator::full_check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// `healthy` when every component is, `degraded` otherwise.
    pub status: HealthStatus,
    pub components: Components,
    /// Seconds since the UNIX epoch.
    pub timestamp: f64,
}

/// Probes the three subsystems.
pub struct HealthAggregator<S: KvStore, C: CacheBackend, Q: MessageBroker> {
    store: Arc<S>,
    cache: Arc<CacheClient<C>>,
    broker: Arc<Q>,
    probe_timeout: Duration,
}

impl<S: KvStore, C: CacheBackend, Q: MessageBroker> HealthAggregator<S, C, Q> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<CacheClient<C>>,
        broker: Arc<Q>,
        probe_timeout: Duration,
    ) -> Self {
        HealthAggregator {
            store,
            cache,
            broker,
            probe_timeout,
        }
    }

    async fn round_trip(&self) -> Result<bool> {
        self.store.put(PROBE_KEY, PROBE_VALUE).await?;
        let read = self.store.get(PROBE_KEY).await?;
        self.store.delete(PROBE_KEY).await?;
        Ok(read.as_deref() == Some(PROBE_VALUE))
    }

    /// Write, read back and remove [`PROBE_KEY`].
    pub async fn check_storage(&self) -> ComponentHealth {
        let backend_type = Some(self.store.kind());
        match self.round_trip().await {
            Ok(matched) => ComponentHealth {
                status: HealthStatus::from_bool(matched),
                backend_type,
                details: ComponentDetails {
                    read_write_test: Some(matched),
                    ..Default::default()
                },
            },
            Err(e) => {
                warn!("⚠ Storage health probe failed: {}", e);
                ComponentHealth {
                    status: HealthStatus::Unhealthy,
                    backend_type,
                    details: ComponentDetails {
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                }
            }
        }
    }

    pub async fn check_cache(&self) -> ComponentHealth {
        ComponentHealth::connection(self.cache.ping().await)
    }

    /// Whether a broker channel can be obtained within the probe timeout.
    pub async fn check_queue(&self) -> ComponentHealth {
        ComponentHealth::connection(self.broker.probe(self.probe_timeout).await)
    }

    /// Run all three probes concurrently.
    pub async fn full_check(&self) -> HealthReport {
        let (storage, cache, message_queue) =
            tokio::join!(self.check_storage(), self.check_cache(), self.check_queue());

        let status = if storage.is_healthy() && cache.is_healthy() && message_queue.is_healthy() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        debug!("Health check: {:?}", status);

        HealthReport {
            status,
            components: Components {
                storage,
                cache,
                message_queue,
            },
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        }
    }

    /// Read-only storage check for liveness probes.
    pub async fn liveness(&self) -> bool {
        self.store.get(PROBE_KEY).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::observability::NoOpMetrics;
    use crate::queue::InMemoryBroker;
    use crate::storage::InMemoryStore;

    struct Fixture {
        store: InMemoryStore,
        cache: InMemoryCache,
        broker: InMemoryBroker,
        health: HealthAggregator<InMemoryStore, InMemoryCache, InMemoryBroker>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let cache = InMemoryCache::new();
        let broker = InMemoryBroker::new();
        let health = HealthAggregator::new(
            Arc::new(store.clone()),
            Arc::new(CacheClient::new(cache.clone(), 10, 1024, Arc::new(NoOpMetrics))),
            Arc::new(broker.clone()),
            Duration::from_millis(200),
        );
        Fixture {
            store,
            cache,
            broker,
            health,
        }
    }

    #[tokio::test]
    async fn test_all_healthy() {
        let f = fixture();
        let report = f.health.full_check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.components.storage.backend_type, Some("memory"));
        assert_eq!(
            report.components.storage.details.read_write_test,
            Some(true)
        );
        assert!(report.timestamp > 0.0);
        // The probe leaves nothing behind.
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_broker_down_is_degraded() {
        let f = fixture();
        f.broker.set_available(false);

        let report = f.health.full_check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(
            report.components.message_queue.status,
            HealthStatus::Unhealthy
        );
        assert_eq!(report.components.message_queue.details.connection, Some(false));
        assert!(report.components.storage.is_healthy());
        assert!(report.components.cache.is_healthy());
    }

    #[tokio::test]
    async fn test_storage_down_reports_error() {
        let f = fixture();
        f.store.set_available(false);

        let report = f.health.full_check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.components.storage.details.error.is_some());
        assert!(report.components.cache.is_healthy());
        assert!(!f.health.liveness().await);
    }

    #[tokio::test]
    async fn test_cache_down_does_not_affect_liveness() {
        let f = fixture();
        f.cache.set_available(false);

        assert_eq!(f.health.check_cache().await.status, HealthStatus::Unhealthy);
        assert!(f.health.liveness().await);
    }

    #[test]
    fn test_report_json_shape() {
        let report = HealthReport {
            status: HealthStatus::Degraded,
            components: Components {
                storage: ComponentHealth {
                    status: HealthStatus::Healthy,
                    backend_type: Some("sqlite"),
                    details: ComponentDetails {
                        read_write_test: Some(true),
                        ..Default::default()
                    },
                },
                cache: ComponentHealth::connection(true),
                message_queue: ComponentHealth::connection(false),
            },
            timestamp: 1.5,
        };

        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(
            json,
            serde_json::json!({
                "status": "degraded",
                "components": {
                    "storage": {
                        "status": "healthy",
                        "backend_type": "sqlite",
                        "details": {"read_write_test": true}
                    },
                    "cache": {"status": "healthy", "details": {"connection": true}},
                    "message_queue": {"status": "unhealthy", "details": {"connection": false}}
                },
                "timestamp": 1.5
            })
        );
    }
}
