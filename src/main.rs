// src/main.rs
use anyhow::Context;
use dex_price_aggregator::{
    config::load_config,
    oracle::JupiterPriceClient,
    store::{LatestPriceCache, PgPriceStore, RedisPriceCache},
    utils::setup_logging,
    Pipeline,
};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Upper bound on the wait for tasks to finish after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    setup_logging(&level).context("failed to initialize logging")?;
    let config = load_config().context("invalid configuration")?;
    info!("🚀 DEX price aggregator starting");

    let store = PgPriceStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to Postgres")?;
    store.migrate().await.context("failed to prepare schema")?;

    let cache: Option<Arc<dyn LatestPriceCache>> = match config.redis_url.as_deref() {
        Some(url) => match RedisPriceCache::new(url, config.latest_price_ttl_secs).await {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!("Latest-price cache disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let oracle = JupiterPriceClient::new(
        config.oracle_base_url.clone(),
        Duration::from_secs(config.oracle_timeout_secs),
    )?;

    let pipeline = Pipeline::new(config.clone(), Arc::new(store), cache, Arc::new(oracle))?;
    pipeline.load_tokens().await;

    let listener = TcpListener::bind(&config.fanout_bind_addr)
        .await
        .with_context(|| format!("failed to bind fan-out listener on {}", config.fanout_bind_addr))?;

    let shutdown = CancellationToken::new();
    let handles = pipeline.start(listener, shutdown.clone());

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("🛑 Shutdown requested, draining");
    shutdown.cancel();

    let joined = tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles)).await;
    match joined {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    error!("Task ended abnormally: {}", e);
                }
            }
        }
        Err(_) => warn!("Tasks still running after {:?}, exiting anyway", SHUTDOWN_GRACE),
    }

    let metrics = pipeline.queue.metrics();
    info!(
        "Stopped. persisted={} dropped={} queued={}",
        metrics.processed, metrics.dropped, metrics.queue_length
    );
    Ok(())
}
