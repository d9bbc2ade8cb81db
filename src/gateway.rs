//! HTTP request gateway.
//!
//! Reads go through the cache-aside [`CacheExpander`]; writes are only
//! enqueued and answered with `202 Accepted`. A `202` means "queued", not
//! "applied": a read right after a write may still see the old value.

use crate::background::BackgroundTasks;
use crate::cache::{CacheBackend, CacheClient};
use crate::error::Error;
use crate::expander::CacheExpander;
use crate::health::{HealthAggregator, HealthStatus};
use crate::observability::Metrics;
use crate::queue::{scalar_text, Intent, MessageBroker, QueueProducer};
use crate::storage::KvStore;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Seconds a client should wait before asking `/health/ready` again.
const READY_RETRY_AFTER: &str = "10";

/// Shared state behind every route.
pub struct Gateway<S: KvStore, C: CacheBackend, Q: MessageBroker> {
    expander: CacheExpander<S, C>,
    producer: QueueProducer<Q>,
    health: HealthAggregator<S, C, Q>,
    metrics: Arc<dyn Metrics>,
}

impl<S: KvStore, C: CacheBackend, Q: MessageBroker> Gateway<S, C, Q> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<CacheClient<C>>,
        broker: Arc<Q>,
        tasks: BackgroundTasks,
        metrics: Arc<dyn Metrics>,
        probe_timeout: Duration,
    ) -> Self {
        Gateway {
            expander: CacheExpander::new(store.clone(), cache.clone(), tasks, metrics.clone()),
            producer: QueueProducer::new(broker.clone(), metrics.clone()),
            health: HealthAggregator::new(store, cache, broker, probe_timeout),
            metrics,
        }
    }

    pub fn expander(&self) -> &CacheExpander<S, C> {
        &self.expander
    }

    pub fn health(&self) -> &HealthAggregator<S, C, Q> {
        &self.health
    }
}

/// Build the router over `gateway`.
pub fn router<S, C, Q>(gateway: Arc<Gateway<S, C, Q>>) -> Router
where
    S: KvStore,
    C: CacheBackend,
    Q: MessageBroker,
{
    let metrics = gateway.metrics.clone();
    Router::new()
        .route(
            "/kv",
            get(get_value::<S, C, Q>)
                .put(put_value::<S, C, Q>)
                .delete(delete_value::<S, C, Q>),
        )
        .route("/cache/stats", get(cache_stats::<S, C, Q>))
        .route("/health", get(health::<S, C, Q>))
        .route("/health/live", get(liveness::<S, C, Q>))
        .route("/health/ready", get(readiness::<S, C, Q>))
        .layer(middleware::from_fn_with_state(metrics, record_request))
        .with_state(gateway)
}

/// Error answered as `{"detail": ...}` with a status picked by subsystem.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) | Error::Payload(_) => StatusCode::BAD_REQUEST,
            Error::Queue(_) | Error::Cache(_) | Error::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage(_) | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("✗ Request failed ({}): {}", self.0.subsystem(), self.0);
        }
        let detail = match &self.0 {
            Error::Validation(msg) => msg.clone(),
            other => other.to_string(),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    key: Option<String>,
}

impl KeyQuery {
    fn require(self) -> Result<String, ApiError> {
        match self.key {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(Error::Validation("key required".to_string()).into()),
        }
    }
}

/// Pull `{data:{key,value}}` out of a PUT body.
fn add_intent(body: &Value) -> Result<Intent, ApiError> {
    let data = body.get("data");
    let key = data
        .and_then(|d| d.get("key"))
        .and_then(scalar_text)
        .filter(|k| !k.is_empty());
    let value = data.and_then(|d| d.get("value")).and_then(scalar_text);

    match (key, value) {
        (Some(key), Some(value)) => Ok(Intent::Add { key, value }),
        _ => Err(Error::Validation("key & value required".to_string()).into()),
    }
}

async fn get_value<S: KvStore, C: CacheBackend, Q: MessageBroker>(
    State(gateway): State<Arc<Gateway<S, C, Q>>>,
    Query(query): Query<KeyQuery>,
) -> Result<Response, ApiError> {
    let key = query.require()?;
    match gateway.expander.get(&key).await? {
        Some(found) => Ok(Json(json!({ "data": found })).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Key not found" })),
        )
            .into_response()),
    }
}

async fn put_value<S: KvStore, C: CacheBackend, Q: MessageBroker>(
    State(gateway): State<Arc<Gateway<S, C, Q>>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|e| ApiError(Error::Validation(e.body_text())))?;
    let intent = add_intent(&body)?;

    gateway.producer.submit(&intent).await?;
    gateway.expander.invalidate(intent.key());
    Ok(queued())
}

async fn delete_value<S: KvStore, C: CacheBackend, Q: MessageBroker>(
    State(gateway): State<Arc<Gateway<S, C, Q>>>,
    Query(query): Query<KeyQuery>,
) -> Result<Response, ApiError> {
    let key = query.require()?;

    gateway.producer.submit(&Intent::Delete { key: key.clone() }).await?;
    gateway.expander.invalidate(&key);
    Ok(queued())
}

fn queued() -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "detail": "queued" }))).into_response()
}

async fn cache_stats<S: KvStore, C: CacheBackend, Q: MessageBroker>(
    State(gateway): State<Arc<Gateway<S, C, Q>>>,
) -> Response {
    match gateway.expander.cache().stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            warn!("⚠ Cache stats unavailable: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn health<S: KvStore, C: CacheBackend, Q: MessageBroker>(
    State(gateway): State<Arc<Gateway<S, C, Q>>>,
) -> Response {
    Json(gateway.health.full_check().await).into_response()
}

async fn liveness<S: KvStore, C: CacheBackend, Q: MessageBroker>(
    State(gateway): State<Arc<Gateway<S, C, Q>>>,
) -> Response {
    if gateway.health.liveness().await {
        Json(json!({ "status": "alive" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": "Service unavailable" })),
        )
            .into_response()
    }
}

async fn readiness<S: KvStore, C: CacheBackend, Q: MessageBroker>(
    State(gateway): State<Arc<Gateway<S, C, Q>>>,
) -> Response {
    let report = gateway.health.full_check().await;
    if report.status == HealthStatus::Healthy {
        Json(json!({ "status": "ready" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, READY_RETRY_AFTER)],
            Json(json!({ "detail": "Service not ready" })),
        )
            .into_response()
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("⚠ Ctrl-C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("⚠ SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

async fn record_request(
    State(metrics): State<Arc<dyn Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    metrics.http_request(&method, &path, status, start.elapsed());
    debug!("{} {} -> {} in {:?}", method, path, status, start.elapsed());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::Applier;
    use crate::cache::InMemoryCache;
    use crate::observability::InMemoryMetrics;
    use crate::queue::{InMemoryBroker, QueueName};
    use crate::storage::InMemoryStore;
    use axum::body::Body;
    use axum::http::Method;
    use tokio::sync::watch;
    use tower::ServiceExt;

    struct Fixture {
        store: InMemoryStore,
        cache: InMemoryCache,
        broker: InMemoryBroker,
        metrics: Arc<InMemoryMetrics>,
        tasks: BackgroundTasks,
        client: Arc<CacheClient<InMemoryCache>>,
        app: Router,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let cache = InMemoryCache::new();
        let broker = InMemoryBroker::new();
        let metrics = Arc::new(InMemoryMetrics::new());
        let tasks = BackgroundTasks::new(16);
        let client = Arc::new(CacheClient::new(cache.clone(), 100, 1 << 20, metrics.clone()));
        let gateway = Arc::new(Gateway::new(
            Arc::new(store.clone()),
            client.clone(),
            Arc::new(broker.clone()),
            tasks.clone(),
            metrics.clone(),
            Duration::from_millis(200),
        ));
        Fixture {
            store,
            cache,
            broker,
            metrics,
            tasks,
            client,
            app: router(gateway),
        }
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = axum::http::Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn drained(broker: &InMemoryBroker) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while QueueName::ALL.iter().any(|q| broker.pending(*q) > 0) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queues drained");
    }

    #[tokio::test]
    async fn test_end_to_end_flow() {
        let f = fixture();
        let applier = Arc::new(Applier::new(
            Arc::new(f.store.clone()),
            f.client.clone(),
            Arc::new(f.broker.clone()),
            f.metrics.clone(),
        ));
        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(applier.run(shutdown));

        let (status, body) = call(
            &f.app,
            Method::PUT,
            "/kv",
            Some(json!({"data": {"key": "a", "value": "1"}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, json!({"detail": "queued"}));

        drained(&f.broker).await;
        f.tasks.wait_idle().await;

        let (status, body) = call(&f.app, Method::GET, "/kv?key=a", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"data": {"value": "1", "source": "database"}}));

        f.tasks.wait_idle().await;
        let (_, body) = call(&f.app, Method::GET, "/kv?key=a", None).await;
        assert_eq!(body, json!({"data": {"value": "1", "source": "cache"}}));

        let (status, _) = call(&f.app, Method::DELETE, "/kv?key=a", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        drained(&f.broker).await;
        f.tasks.wait_idle().await;

        let (status, body) = call(&f.app, Method::GET, "/kv?key=a", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"detail": "Key not found"}));

        assert_eq!(f.metrics.counter("kv_request_total{PUT,/kv,202}"), 1);
        assert_eq!(f.metrics.counter("kv_request_total{GET,/kv,200}"), 2);

        stop.send(true).expect("signal");
        running.await.expect("applier");
    }

    #[tokio::test]
    async fn test_put_is_queued_not_applied() {
        let f = fixture();
        let (status, _) = call(
            &f.app,
            Method::PUT,
            "/kv",
            Some(json!({"data": {"key": "a", "value": 7}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(f.broker.pending(QueueName::AddKey), 1);
        assert!(f.store.is_empty());

        // No applier is running, so the write is not visible yet.
        let (status, _) = call(&f.app, Method::GET, "/kv?key=a", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_put_invalidates_cached_value() {
        let f = fixture();
        f.cache.set("a", "old", None).await.expect("set");

        call(
            &f.app,
            Method::PUT,
            "/kv",
            Some(json!({"data": {"key": "a", "value": "new"}})),
        )
        .await;
        f.tasks.wait_idle().await;
        assert_eq!(f.cache.get("a").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_put_validation() {
        let f = fixture();
        for body in [
            json!({"data": {"key": "a"}}),
            json!({"data": {"value": "1"}}),
            json!({"data": {"key": "", "value": "1"}}),
            json!({"data": {"key": "a", "value": null}}),
            json!({"data": {"key": "a", "value": [1, 2]}}),
            json!({"key": "a", "value": "1"}),
        ] {
            let (status, reply) = call(&f.app, Method::PUT, "/kv", Some(body.clone())).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "accepted {}", body);
            assert_eq!(reply, json!({"detail": "key & value required"}));
        }
        assert_eq!(f.broker.pending(QueueName::AddKey), 0);
    }

    #[tokio::test]
    async fn test_missing_key_query_is_rejected() {
        let f = fixture();
        let (status, _) = call(&f.app, Method::GET, "/kv", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&f.app, Method::DELETE, "/kv?key=", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_broker_outage_fails_writes_only() {
        let f = fixture();
        f.store.put("a", "1").await.expect("put");
        f.broker.set_available(false);

        let (status, _) = call(
            &f.app,
            Method::PUT,
            "/kv",
            Some(json!({"data": {"key": "a", "value": "2"}})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = call(&f.app, Method::DELETE, "/kv?key=a", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = call(&f.app, Method::GET, "/kv?key=a", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["value"], "1");
    }

    #[tokio::test]
    async fn test_storage_outage_fails_uncached_reads() {
        let f = fixture();
        f.store.set_available(false);
        let (status, body) = call(&f.app, Method::GET, "/kv?key=a", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn test_cache_stats() {
        let f = fixture();
        f.cache.set("x", "1", None).await.expect("set");
        call(&f.app, Method::GET, "/kv?key=x", None).await;
        call(&f.app, Method::GET, "/kv?key=y", None).await;

        let (status, stats) = call(&f.app, Method::GET, "/cache/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["keys_count"], 1);
        assert_eq!(stats["max_keys_limit"], 100);
        assert_eq!(stats["max_memory_bytes"], 1 << 20);
        assert_eq!(stats["hits"], 1);
        assert_eq!(stats["misses"], 1);
        assert_eq!(stats["hit_rate"], 50.0);

        f.cache.set_available(false);
        let (status, body) = call(&f.app, Method::GET, "/cache/stats", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let f = fixture();
        let (status, body) = call(&f.app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = call(&f.app, Method::GET, "/health/live", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "alive"}));

        let (status, body) = call(&f.app, Method::GET, "/health/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ready"}));
    }

    #[tokio::test]
    async fn test_degraded_health() {
        let f = fixture();
        f.broker.set_available(false);

        let (status, body) = call(&f.app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["components"]["message_queue"]["status"], "unhealthy");
        assert_eq!(body["components"]["storage"]["status"], "healthy");

        let response = f
            .app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health/ready")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
            Some("10")
        );

        // Liveness only reads storage.
        let (status, _) = call(&f.app, Method::GET, "/health/live", None).await;
        assert_eq!(status, StatusCode::OK);

        f.store.set_available(false);
        let (status, body) = call(&f.app, Method::GET, "/health/live", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({"detail": "Service unavailable"}));
    }
}
