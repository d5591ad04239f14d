//! Timers/Workers gRPC API.
//!
//! Runs migrations, then serves the API with health checks and `/metrics`
//! until SIGTERM or Ctrl+C.

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use sand::{PostgresBackend, config::Config, metrics, observability, server::run_server};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let config = Config::from_env()?;
    info!(
        grpc_addr = %config.grpc_addr,
        metrics_addr = %config.metrics_addr,
        shard_count = config.shard_count,
        "starting sand server"
    );

    let backend = PostgresBackend::connect(&config.database_url, config.db_max_connections)
        .await?
        .with_max_attempts(config.max_attempts);
    info!("connected to database, migrations applied");

    let metrics = metrics::init()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_handle = tokio::spawn(metrics::run_metrics_server(
        config.metrics_addr,
        metrics,
        shutdown_rx.clone(),
    ));
    let server_handle = tokio::spawn(run_server(
        config.grpc_addr,
        backend,
        config.shard_map(),
        shutdown_rx,
    ));

    observability::wait_for_shutdown().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    server_handle.await??;
    if let Err(err) = metrics_handle.await? {
        warn!(error = %err, "metrics server exited with error");
    }
    Ok(())
}
