//! Queue consumer that applies intents to storage.
//!
//! Each delivery goes `received → processing → acked`, whether or not the
//! apply worked. A failed apply is logged and counted, never retried here, so
//! a poison message cannot wedge its queue. Storage operations are upserts
//! and deletes, which makes redelivered messages harmless.

use crate::cache::{CacheBackend, CacheClient};
use crate::error::Result;
use crate::observability::Metrics;
use crate::policy::{self, Operation};
use crate::queue::{Delivery, Intent, MessageBroker, QueueName};
use crate::storage::KvStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// First delay before re-subscribing to a queue.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Upper bound for the re-subscribe delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Result of handling one delivery. The delivery is acknowledged in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Storage refused the change.
    Failed,
    /// Payload could not be decoded.
    Rejected,
}

pub struct Applier<S: KvStore, C: CacheBackend, Q: MessageBroker> {
    store: Arc<S>,
    cache: Arc<CacheClient<C>>,
    broker: Arc<Q>,
    metrics: Arc<dyn Metrics>,
    live: AtomicUsize,
}

impl<S: KvStore, C: CacheBackend, Q: MessageBroker> Applier<S, C, Q> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<CacheClient<C>>,
        broker: Arc<Q>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Applier {
            store,
            cache,
            broker,
            metrics,
            live: AtomicUsize::new(0),
        }
    }

    /// Whether every queue currently has an active subscription.
    pub fn is_healthy(&self) -> bool {
        self.live.load(Ordering::SeqCst) == QueueName::ALL.len()
    }

    /// Decode and apply one payload received from `queue`.
    pub async fn handle(&self, queue: QueueName, payload: &[u8]) -> Outcome {
        let started = Instant::now();

        let intent = match policy::settle(Operation::PayloadDecode, Intent::decode(queue, payload)) {
            Ok(Some(intent)) => intent,
            _ => {
                self.metrics.message_processed(queue.as_str(), "error");
                error!("✗ Dropped undecodable {} message", queue);
                return Outcome::Rejected;
            }
        };

        let applied = match &intent {
            Intent::Add { key, value } => self.apply_add(queue, key, value).await,
            Intent::Delete { key } => self.apply_delete(queue, key).await,
        };

        match policy::settle(Operation::StorageApply, applied) {
            Ok(Some(())) => {
                self.metrics
                    .processing_time(queue.as_str(), "total", started.elapsed());
                self.metrics.message_processed(queue.as_str(), "success");
                debug!("✓ Applied {} {} in {:?}", queue, intent.key(), started.elapsed());
                Outcome::Applied
            }
            _ => {
                self.metrics.message_processed(queue.as_str(), "error");
                error!("✗ Failed to apply {} {}, message dropped", queue, intent.key());
                Outcome::Failed
            }
        }
    }

    /// Handle a delivery, then acknowledge it.
    pub async fn process(&self, queue: QueueName, delivery: Delivery) -> Outcome {
        if delivery.redelivered() {
            debug!("Redelivered message on {}", queue);
        }
        let outcome = self.handle(queue, delivery.payload()).await;
        if let Err(e) = delivery.ack().await {
            warn!("⚠ Ack on {} failed, message may be redelivered: {}", queue, e);
        }
        outcome
    }

    async fn apply_add(&self, queue: QueueName, key: &str, value: &str) -> Result<()> {
        let timer = Instant::now();
        if let Err(e) = self.store.put(key, value).await {
            self.metrics.storage_operation("upsert", "error");
            return Err(e);
        }
        self.metrics
            .processing_time(queue.as_str(), "db_write", timer.elapsed());
        self.metrics.storage_operation("upsert", "success");

        self.invalidate(queue, key).await;
        Ok(())
    }

    async fn apply_delete(&self, queue: QueueName, key: &str) -> Result<()> {
        let timer = Instant::now();
        if let Err(e) = self.store.delete(key).await {
            self.metrics.storage_operation("delete", "error");
            return Err(e);
        }
        self.metrics
            .processing_time(queue.as_str(), "db_delete", timer.elapsed());
        self.metrics.storage_operation("delete", "success");

        self.invalidate(queue, key).await;
        Ok(())
    }

    async fn invalidate(&self, queue: QueueName, key: &str) {
        let timer = Instant::now();
        if policy::absorb(Operation::CacheInvalidate, self.cache.delete(key).await) {
            self.metrics
                .processing_time(queue.as_str(), "cache_delete", timer.elapsed());
            self.metrics.cache_operation("delete", "success");
        } else {
            self.metrics.cache_operation("delete", "error");
        }
    }

    fn mark(&self, subscribed: bool) {
        let live = if subscribed {
            self.live.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.live.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
        };
        self.metrics.consumer_status(live == QueueName::ALL.len());
    }

    /// Consume `queue` until shutdown, re-subscribing with backoff whenever
    /// the subscription fails or ends.
    pub async fn consume(&self, queue: QueueName, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let mut stream = match self.broker.subscribe(queue).await {
                Ok(stream) => {
                    backoff = INITIAL_BACKOFF;
                    stream
                }
                Err(e) => {
                    warn!(
                        "⚠ Subscribe to {} failed, retrying in {:?}: {}",
                        queue, backoff, e
                    );
                    tokio::select! {
                        _ = stopped(&mut shutdown) => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            self.mark(true);
            info!("✓ Applier listening on {}", queue);

            let stop = loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => break true,
                    next = stream.next() => match next {
                        Some(Ok(delivery)) => {
                            self.process(queue, delivery).await;
                        }
                        Some(Err(e)) => {
                            warn!("⚠ Delivery stream for {} failed: {}", queue, e);
                            break false;
                        }
                        None => {
                            warn!("⚠ Delivery stream for {} ended", queue);
                            break false;
                        }
                    }
                }
            };

            self.mark(false);
            if stop {
                return;
            }
        }
    }

    /// Consume both queues concurrently until `shutdown` flips to `true`, then
    /// close the broker.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let loops: Vec<_> = QueueName::ALL
            .into_iter()
            .map(|queue| {
                let applier = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { applier.consume(queue, shutdown).await })
            })
            .collect();

        for handle in loops {
            if let Err(e) = handle.await {
                error!("✗ Applier loop aborted: {}", e);
            }
        }

        self.metrics.consumer_status(false);
        if let Err(e) = self.broker.close().await {
            warn!("⚠ Closing broker failed: {}", e);
        }
        info!("✓ Applier stopped");
    }
}

/// `GET /health` for a standalone applier process.
pub fn health_router<S, C, Q>(applier: Arc<Applier<S, C, Q>>) -> Router
where
    S: KvStore,
    C: CacheBackend,
    Q: MessageBroker,
{
    Router::new()
        .route("/health", get(consumer_health::<S, C, Q>))
        .with_state(applier)
}

async fn consumer_health<S: KvStore, C: CacheBackend, Q: MessageBroker>(
    State(applier): State<Arc<Applier<S, C, Q>>>,
) -> Response {
    if applier.is_healthy() {
        Json(json!({ "status": "healthy" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy" })),
        )
            .into_response()
    }
}

/// Resolves once shutdown is requested or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
