//! Delivery worker: claims due timers and invokes their RPC targets.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use sand::{
    PostgresBackend,
    config::Config,
    metrics, observability,
    rpc::{ConnectionCache, DescriptorResolver, DynamicInvoker, TransportSecurity},
    workers::{DeliveryConfig, spawn_delivery_worker},
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let config = Config::from_env()?;
    let shard_ids = config.worker_shards();
    info!(
        identity = %config.worker.identity,
        shards = ?shard_ids,
        tls = config.rpc.tls,
        "starting sand worker"
    );

    let backend = PostgresBackend::connect(&config.database_url, config.db_max_connections)
        .await?
        .with_max_attempts(config.max_attempts);

    let resolver = DescriptorResolver::with_files(config.rpc.descriptor_sets.as_slice())?;
    let security = TransportSecurity::from_settings(config.rpc.tls, config.rpc.tls_ca.as_deref())?;
    let invoker = DynamicInvoker::new(
        Arc::new(resolver),
        Arc::new(ConnectionCache::new(security)),
    );

    let metrics = metrics::init()?;
    let delivery_config = DeliveryConfig {
        identity: config.worker.identity.clone(),
        shard_ids,
        interval: config.worker.interval,
        batch_size: config.worker.batch_size,
        parallelism: config.worker.parallelism,
        lease: config.worker.lease,
    };
    let (worker_handle, shutdown_tx) =
        spawn_delivery_worker(backend, Arc::new(invoker), delivery_config, metrics.clone());
    let metrics_handle = tokio::spawn(metrics::run_metrics_server(
        config.metrics_addr,
        metrics,
        shutdown_tx.subscribe(),
    ));

    observability::wait_for_shutdown().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    worker_handle.await?;
    if let Err(err) = metrics_handle.await? {
        warn!(error = %err, "metrics server exited with error");
    }
    Ok(())
}
