//! Delivery worker: claims due timers and invokes their targets.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Semaphore, watch};
use tokio::time::MissedTickBehavior;
use tonic::async_trait;
use tracing::{debug, error, info, warn};

use crate::backends::{BackendError, ClaimRequest, TimerStore, WorkerStatusBackend};
use crate::metrics::Metrics;
use crate::rpc::{DeliveryError, DynamicInvoker};
use crate::timer::Timer;

/// Performs the side effect a timer stands for.
#[async_trait]
pub trait TimerDelivery: Send + Sync {
    async fn deliver(&self, timer: &Timer) -> Result<(), DeliveryError>;
}

#[async_trait]
impl TimerDelivery for DynamicInvoker {
    async fn deliver(&self, timer: &Timer) -> Result<(), DeliveryError> {
        self.invoke(&timer.target).await.map(|_| ())
    }
}

/// Configuration for a delivery worker.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub identity: String,
    pub shard_ids: Vec<i32>,
    /// Tick period, also the deadline of each tick.
    pub interval: Duration,
    /// Timers claimed per shard per tick.
    pub batch_size: usize,
    /// Upper bound on concurrent deliveries.
    pub parallelism: usize,
    pub lease: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            identity: "worker".to_string(),
            shard_ids: vec![0],
            interval: Duration::from_secs(10),
            batch_size: 100,
            parallelism: 255,
            lease: Duration::from_secs(60),
        }
    }
}

/// Per-tick tally of delivery outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub claimed: usize,
    pub delivered: usize,
    pub remote_errors: usize,
    pub internal_errors: usize,
    /// Outcomes that could not be written back.
    pub store_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Remote,
    Internal,
    StoreError,
}

pub struct DeliveryWorker<B, D> {
    backend: B,
    delivery: Arc<D>,
    config: DeliveryConfig,
    metrics: Metrics,
    permits: Arc<Semaphore>,
}

impl<B, D> DeliveryWorker<B, D>
where
    B: TimerStore + WorkerStatusBackend + Clone + Send + Sync + 'static,
    D: TimerDelivery + 'static,
{
    pub fn new(backend: B, delivery: Arc<D>, config: DeliveryConfig, metrics: Metrics) -> Self {
        let permits = Arc::new(Semaphore::new(config.parallelism.max(1)));
        Self {
            backend,
            delivery,
            config,
            metrics,
            permits,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Run the delivery loop until the shutdown flag flips.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            identity = %self.config.identity,
            shards = ?self.config.shard_ids,
            interval_ms = self.config.interval.as_millis(),
            batch_size = self.config.batch_size,
            parallelism = self.config.parallelism,
            "delivery worker started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("delivery worker shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match tokio::time::timeout(self.config.interval, self.tick()).await {
                        Ok(Ok(summary)) => {
                            if summary.claimed > 0 {
                                info!(
                                    claimed = summary.claimed,
                                    delivered = summary.delivered,
                                    remote_errors = summary.remote_errors,
                                    internal_errors = summary.internal_errors,
                                    "delivery tick complete"
                                );
                            }
                        }
                        Ok(Err(err)) => error!(error = %err, "delivery tick failed"),
                        Err(_) => warn!(
                            deadline_ms = self.config.interval.as_millis(),
                            "delivery tick exceeded its deadline; in-flight deliveries continue"
                        ),
                    }
                }
            }
        }
    }

    pub async fn tick(&self) -> Result<TickSummary, BackendError> {
        self.tick_at(Utc::now()).await
    }

    /// Heartbeat, claim every configured shard and deliver what was claimed.
    ///
    /// A failed claim aborts the tick. Deliveries already started are still
    /// awaited so their outcomes are recorded.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickSummary, BackendError> {
        if let Err(err) = self.backend.upsert_worker(&self.config.identity, now).await {
            warn!(identity = %self.config.identity, error = %err, "failed to record worker heartbeat");
        }

        let mut summary = TickSummary::default();
        let mut handles = Vec::new();
        let mut claim_error = None;

        for shard_id in &self.config.shard_ids {
            let claim = ClaimRequest {
                shard_id: *shard_id,
                worker: self.config.identity.clone(),
                now,
                batch_size: self.config.batch_size,
                lease: self.config.lease,
            };
            let timers = match self.backend.claim_timers(&claim).await {
                Ok(timers) => timers,
                Err(err) => {
                    claim_error = Some(err);
                    break;
                }
            };
            if !timers.is_empty() {
                debug!(shard_id, claimed = timers.len(), "claimed timers");
            }
            summary.claimed += timers.len();

            for timer in timers {
                let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                    break;
                };
                let backend = self.backend.clone();
                let delivery = Arc::clone(&self.delivery);
                let metrics = self.metrics.clone();
                handles.push(tokio::spawn(async move {
                    let outcome = deliver_one(&backend, delivery.as_ref(), &metrics, timer).await;
                    drop(permit);
                    outcome
                }));
            }
        }

        for joined in join_all(handles).await {
            match joined {
                Ok(Outcome::Delivered) => summary.delivered += 1,
                Ok(Outcome::Remote) => summary.remote_errors += 1,
                Ok(Outcome::Internal) => summary.internal_errors += 1,
                Ok(Outcome::StoreError) => summary.store_errors += 1,
                Err(err) => {
                    error!(error = %err, "delivery task panicked");
                    summary.internal_errors += 1;
                }
            }
        }

        match claim_error {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

async fn deliver_one<B, D>(backend: &B, delivery: &D, metrics: &Metrics, timer: Timer) -> Outcome
where
    B: TimerStore,
    D: TimerDelivery + ?Sized,
{
    let result = delivery.deliver(&timer).await;
    metrics.record_timer_processed();
    let target = &timer.target;

    match result {
        Ok(()) => match backend.mark_delivered(timer.id, Utc::now()).await {
            Ok(()) => {
                debug!(
                    timer_id = %timer.id,
                    timer_name = %timer.name,
                    rpc_method = %target.method,
                    attempt = timer.attempt,
                    "timer delivered"
                );
                Outcome::Delivered
            }
            Err(err) => {
                error!(
                    timer_id = %timer.id,
                    timer_name = %timer.name,
                    error = %err,
                    "failed to mark timer delivered"
                );
                Outcome::StoreError
            }
        },
        Err(err @ DeliveryError::Remote { .. }) => {
            metrics.record_remote_error();
            warn!(
                timer_id = %timer.id,
                timer_name = %timer.name,
                rpc_addr = %target.addr,
                rpc_authority = %target.authority,
                rpc_method = %target.method,
                err_type = err.err_type(),
                attempt = timer.attempt,
                error = %err,
                "timer delivery failed"
            );
            let status_code = err.status_code().unwrap_or(tonic::Code::Unknown as i32);
            match backend
                .mark_attempted(&timer, status_code, &err.to_string())
                .await
            {
                Ok(true) => Outcome::Remote,
                Ok(false) => {
                    debug!(
                        timer_id = %timer.id,
                        attempt = timer.attempt,
                        "lease moved on, failed attempt not recorded"
                    );
                    Outcome::Remote
                }
                Err(store_err) => {
                    error!(
                        timer_id = %timer.id,
                        error = %store_err,
                        "failed to record delivery attempt"
                    );
                    Outcome::StoreError
                }
            }
        }
        Err(err @ DeliveryError::Internal(_)) => {
            // The lease is left to expire; the next claim counts as a new attempt.
            metrics.record_internal_error();
            error!(
                timer_id = %timer.id,
                timer_name = %timer.name,
                rpc_addr = %target.addr,
                rpc_authority = %target.authority,
                rpc_method = %target.method,
                err_type = err.err_type(),
                attempt = timer.attempt,
                error = %err,
                "timer delivery failed"
            );
            Outcome::Internal
        }
    }
}

/// Convenience function to spawn a delivery worker.
pub fn spawn_delivery_worker<B, D>(
    backend: B,
    delivery: Arc<D>,
    config: DeliveryConfig,
    metrics: Metrics,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>)
where
    B: TimerStore + WorkerStatusBackend + Clone + Send + Sync + 'static,
    D: TimerDelivery + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = DeliveryWorker::new(backend, delivery, config, metrics);
    let handle = tokio::spawn(worker.run(shutdown_rx));
    (handle, shutdown_tx)
}
