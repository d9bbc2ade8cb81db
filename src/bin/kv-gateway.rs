//! HTTP gateway process, optionally running the applier in-process.

#[macro_use]
extern crate log;

use deferred_kv::gateway::{router, shutdown_signal};
use deferred_kv::{
    Applier, BackgroundTasks, Broker, Cache, CacheClient, Config, Error, Gateway, InMemoryMetrics,
    MessageBroker, Metrics, Result, Store,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()
        .ok();

    let config = Config::from_env();
    let metrics: Arc<dyn Metrics> = Arc::new(InMemoryMetrics::new());

    let store = Arc::new(Store::from_config(&config.storage)?);
    let cache = Arc::new(CacheClient::with_config(
        Cache::from_config(&config.cache)?,
        &config.cache,
        metrics.clone(),
    ));
    cache.configure_limits().await;
    let broker = Arc::new(Broker::from_config(&config.queue)?);
    let tasks = BackgroundTasks::new(config.background_task_limit);

    let (stop, shutdown) = watch::channel(false);
    let applier = if config.embed_applier {
        info!("✓ Running embedded applier");
        let applier = Arc::new(Applier::new(
            store.clone(),
            cache.clone(),
            broker.clone(),
            metrics.clone(),
        ));
        Some(tokio::spawn(applier.run(shutdown)))
    } else {
        None
    };

    let gateway = Arc::new(Gateway::new(
        store.clone(),
        cache.clone(),
        broker.clone(),
        tasks.clone(),
        metrics,
        config.probe_timeout,
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("Failed to bind {}: {}", addr, e)))?;
    info!("✓ Gateway listening on http://{}", addr);

    let served = axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = served {
        error!("✗ Server error: {}", e);
    }

    let _ = stop.send(true);
    match applier {
        Some(handle) => {
            if let Err(e) = handle.await {
                error!("✗ Embedded applier aborted: {}", e);
            }
        }
        None => {
            if let Err(e) = broker.close().await {
                warn!("⚠ Closing broker failed: {}", e);
            }
        }
    }

    tasks.wait_idle().await;
    cache.backend().close();
    store.close().await;
    info!("✓ Gateway stopped");
    Ok(())
}
