//! Leader-elected scheduler: due counters, culling and last-run bookkeeping.

use anyhow::Result;
use tracing::{info, warn};
use uuid::Uuid;

use sand::{
    LeaderElector, PostgresBackend,
    config::Config,
    metrics, observability,
    scheduler::{SchedulerTaskConfig, spawn_scheduler},
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let config = Config::from_env()?;
    let identity = format!("scheduler-{}", Uuid::new_v4());
    info!(
        identity = %identity,
        namespace = %config.scheduler.namespace,
        interval_ms = config.scheduler.interval.as_millis(),
        "starting sand scheduler"
    );

    let backend = PostgresBackend::connect(&config.database_url, config.db_max_connections)
        .await?
        .with_max_attempts(config.max_attempts);

    let metrics = metrics::init()?;
    let elector = LeaderElector::new(
        backend.clone(),
        config.scheduler.namespace.clone(),
        identity,
        config.scheduler.leader_lease_timeout,
    );
    let task_config = SchedulerTaskConfig {
        interval: config.scheduler.interval,
        due_batch_size: config.scheduler.due_batch_size,
        shard_ids: config.shard_map().all(),
    };
    let (scheduler_handle, shutdown_tx) =
        spawn_scheduler(backend, elector, task_config, metrics.clone());
    let metrics_handle = tokio::spawn(metrics::run_metrics_server(
        config.metrics_addr,
        metrics,
        shutdown_tx.subscribe(),
    ));

    observability::wait_for_shutdown().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    scheduler_handle.await?;
    if let Err(err) = metrics_handle.await? {
        warn!(error = %err, "metrics server exited with error");
    }
    Ok(())
}
