//! Standalone applier process with its own health endpoint.

#[macro_use]
extern crate log;

use deferred_kv::applier::health_router;
use deferred_kv::gateway::shutdown_signal;
use deferred_kv::{
    Applier, Broker, Cache, CacheClient, Config, Error, InMemoryMetrics, Metrics, Result, Store,
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

    let engines = Store::from_config(&config.storage).and_then(|store| {
        let cache = Cache::from_config(&config.cache)?;
        let broker = Broker::from_config(&config.queue)?;
        Ok((store, cache, broker))
    });
    let (store, cache, broker) = match engines {
        Ok(engines) => engines,
        Err(e) => {
            metrics.consumer_status(false);
            error!("✗ Applier startup failed: {}", e);
            return Err(e);
        }
    };

    let store = Arc::new(store);
    let cache = Arc::new(CacheClient::with_config(cache, &config.cache, metrics.clone()));
    let applier = Arc::new(Applier::new(
        store.clone(),
        cache.clone(),
        Arc::new(broker),
        metrics,
    ));

    let (stop, shutdown) = watch::channel(false);
    let running = tokio::spawn(applier.clone().run(shutdown));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("Failed to bind {}: {}", addr, e)))?;
    info!("✓ Applier health endpoint on http://{}/health", addr);

    let served = axum::serve(listener, health_router(applier))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = served {
        error!("✗ Health server error: {}", e);
    }

    let _ = stop.send(true);
    if let Err(e) = running.await {
        error!("✗ Applier aborted: {}", e);
    }

    cache.backend().close();
    store.close().await;
    info!("✓ Applier process stopped");
    Ok(())
}
