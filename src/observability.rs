//! Metrics sink the core reports into.
//!
//! The core never exports metrics itself; it calls a [`Metrics`]
//! implementation supplied at construction. Every method has a no-op default
//! so sinks only implement what they care about.

use dashmap::DashMap;
use std::time::Duration;

/// Counter, gauge and histogram events emitted by the core.
pub trait Metrics: Send + Sync {
    /// Cache lookup found the key.
    fn cache_hit(&self) {}

    /// Cache lookup did not find the key (or the cache was unreachable).
    fn cache_miss(&self) {}

    /// Sampled number of keys held by the cache service.
    fn cache_size(&self, _keys: u64) {}

    /// Latency of a storage call made on the request path.
    fn storage_latency(&self, _operation: &str, _duration: Duration) {}

    /// Sampled depth of a named queue.
    fn queue_depth(&self, _queue: &str, _depth: u64) {}

    /// Time spent publishing one intent.
    fn publish_latency(&self, _queue: &str, _duration: Duration) {}

    /// One message left the applier, `status` is `success` or `error`.
    fn message_processed(&self, _queue: &str, _status: &str) {}

    /// Duration of one stage of message handling.
    fn processing_time(&self, _queue: &str, _stage: &str, _duration: Duration) {}

    /// Outcome of a storage mutation made by the applier.
    fn storage_operation(&self, _operation: &str, _status: &str) {}

    /// Outcome of a cache mutation made by the applier.
    fn cache_operation(&self, _operation: &str, _status: &str) {}

    /// Whether the applier's consume loops are running.
    fn consumer_status(&self, _healthy: bool) {}

    /// One request served by the gateway.
    fn http_request(&self, _method: &str, _path: &str, _status: u16, _duration: Duration) {}
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl Metrics for NoOpMetrics {}

/// Keeps counters and gauges in process memory.
///
/// Counter keys are the metric name followed by its label values, e.g.
/// `kv_consumer_messages_processed_total{add_key,success}`. Histogram-style
/// events are recorded as observation counts under the same scheme.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, zero if never incremented.
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Current value of a gauge, if ever set.
    pub fn gauge(&self, key: &str) -> Option<f64> {
        self.gauges.get(key).map(|v| *v)
    }

    fn inc(&self, key: String) {
        *self.counters.entry(key).or_insert(0) += 1;
    }

    fn set(&self, key: String, value: f64) {
        self.gauges.insert(key, value);
    }
}

fn labelled(name: &str, labels: &[&str]) -> String {
    format!("{}{{{}}}", name, labels.join(","))
}

impl Metrics for InMemoryMetrics {
    fn cache_hit(&self) {
        self.inc("kv_cache_hit_total".to_string());
    }

    fn cache_miss(&self) {
        self.inc("kv_cache_miss_total".to_string());
    }

    fn cache_size(&self, keys: u64) {
        self.set("kv_cache_size".to_string(), keys as f64);
    }

    fn storage_latency(&self, operation: &str, _duration: Duration) {
        self.inc(labelled("kv_db_operation_latency_seconds_count", &[operation]));
    }

    fn queue_depth(&self, queue: &str, depth: u64) {
        self.set(labelled("kv_mq_queue_size", &[queue]), depth as f64);
    }

    fn publish_latency(&self, queue: &str, _duration: Duration) {
        self.inc(labelled("kv_mq_processing_seconds_count", &[queue]));
    }

    fn message_processed(&self, queue: &str, status: &str) {
        self.inc(labelled(
            "kv_consumer_messages_processed_total",
            &[queue, status],
        ));
    }

    fn processing_time(&self, queue: &str, stage: &str, _duration: Duration) {
        self.inc(labelled("kv_consumer_processing_seconds_count", &[queue, stage]));
    }

    fn storage_operation(&self, operation: &str, status: &str) {
        self.inc(labelled(
            "kv_consumer_db_operations_total",
            &[operation, status],
        ));
    }

    fn cache_operation(&self, operation: &str, status: &str) {
        self.inc(labelled(
            "kv_consumer_cache_operations_total",
            &[operation, status],
        ));
    }

    fn consumer_status(&self, healthy: bool) {
        self.set(
            "kv_consumer_status".to_string(),
            if healthy { 1.0 } else { 0.0 },
        );
    }

    fn http_request(&self, method: &str, path: &str, status: u16, _duration: Duration) {
        let status = status.to_string();
        self.inc(labelled("kv_request_total", &[method, path, &status]));
    }
}
