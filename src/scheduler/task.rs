//! Background scheduler task.
//!
//! Ticks on minute boundaries. On each tick the elected leader numbers newly due
//! timers, culls dead ones and records a heartbeat. Followers only take part in
//! the election.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::leader::{LeaderElector, LeaderState};
use crate::backends::{BackendError, FencingToken, SchedulerBackend, TimerStore};
use crate::metrics::Metrics;

/// Configuration for the scheduler task.
#[derive(Debug, Clone)]
pub struct SchedulerTaskConfig {
    /// Time between ticks, also the deadline of each tick.
    pub interval: Duration,
    /// Due counters assigned per statement.
    pub due_batch_size: usize,
    /// Shards culled on every tick.
    pub shard_ids: Vec<i32>,
}

impl Default for SchedulerTaskConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            due_batch_size: 500,
            shard_ids: vec![0],
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("previous scheduler tick is still running")]
    Busy,
    #[error("scheduler tick exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
    #[error("scheduler tick panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub state: LeaderState,
    pub assigned: usize,
    pub culled: u64,
}

/// Time left until the next wall-clock minute. Zero exactly on a boundary.
pub fn delay_until_next_minute(now: DateTime<Utc>) -> Duration {
    let nanos_into_minute =
        u64::from(now.second()) * 1_000_000_000 + u64::from(now.nanosecond().min(999_999_999));
    if nanos_into_minute == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(60 * 1_000_000_000 - nanos_into_minute)
}

/// Background scheduler task.
pub struct SchedulerTask<B> {
    backend: B,
    elector: Arc<Mutex<LeaderElector<B>>>,
    config: SchedulerTaskConfig,
    metrics: Metrics,
    shutdown_rx: watch::Receiver<bool>,
}

impl<B> SchedulerTask<B>
where
    B: SchedulerBackend + TimerStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        backend: B,
        elector: LeaderElector<B>,
        config: SchedulerTaskConfig,
        metrics: Metrics,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            backend,
            elector: Arc::new(Mutex::new(elector)),
            config,
            metrics,
            shutdown_rx,
        }
    }

    /// Run the scheduler loop.
    pub async fn run(mut self) {
        let delay = delay_until_next_minute(Utc::now());
        info!(
            interval_ms = self.config.interval.as_millis(),
            due_batch_size = self.config.due_batch_size,
            shards = self.config.shard_ids.len(),
            first_tick_in_ms = delay.as_millis(),
            "scheduler task started"
        );

        tokio::select! {
            _ = self.shutdown_rx.wait_for(|stop| *stop) => {
                info!("scheduler task shutting down");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("scheduler task shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run_tick().await {
                        error!(error = %err, "scheduler tick failed");
                    }
                }
            }
        }
    }

    /// Run one tick under the interval deadline and record its outcome.
    ///
    /// A tick that overruns keeps running detached; the next tick reports
    /// [`SchedulerError::Busy`] until it finishes.
    pub async fn run_tick(&self) -> Result<TickReport, SchedulerError> {
        let started = Instant::now();
        self.metrics.record_scheduler_tick_started();
        let mut handle = tokio::spawn(tick_once(
            self.backend.clone(),
            Arc::clone(&self.elector),
            self.config.clone(),
            Utc::now(),
        ));

        let result = match tokio::time::timeout(self.config.interval, &mut handle).await {
            Ok(joined) => joined.map_err(SchedulerError::from).and_then(|result| result),
            Err(_) => Err(SchedulerError::DeadlineExceeded(self.config.interval)),
        };

        match &result {
            Ok(report) => {
                let elapsed = started.elapsed();
                self.metrics.record_scheduler_tick_elapsed(elapsed);
                debug!(
                    state = ?report.state,
                    assigned = report.assigned,
                    culled = report.culled,
                    elapsed_ms = elapsed.as_millis(),
                    "scheduler tick complete"
                );
            }
            Err(_) => self.metrics.record_scheduler_tick_error(),
        }
        result
    }
}

async fn tick_once<B>(
    backend: B,
    elector: Arc<Mutex<LeaderElector<B>>>,
    config: SchedulerTaskConfig,
    now: DateTime<Utc>,
) -> Result<TickReport, SchedulerError>
where
    B: SchedulerBackend + TimerStore,
{
    let mut elector = elector.try_lock().map_err(|_| SchedulerError::Busy)?;
    let state = elector.step(now).await?;
    let Some(token) = elector.token() else {
        return Ok(TickReport {
            state,
            assigned: 0,
            culled: 0,
        });
    };

    match leader_duties(&backend, &token, &config, now).await {
        Ok((assigned, culled)) => Ok(TickReport {
            state,
            assigned,
            culled,
        }),
        Err(err) => {
            if matches!(err, BackendError::Fenced { .. }) {
                elector.demote();
            }
            Err(err.into())
        }
    }
}

async fn leader_duties<B>(
    backend: &B,
    token: &FencingToken,
    config: &SchedulerTaskConfig,
    now: DateTime<Utc>,
) -> Result<(usize, u64), BackendError>
where
    B: SchedulerBackend + TimerStore,
{
    let mut assigned = 0usize;
    if config.due_batch_size > 0 {
        loop {
            let batch = backend
                .assign_due_counters(token, now, config.due_batch_size)
                .await?;
            assigned += batch;
            if batch < config.due_batch_size {
                break;
            }
            debug!(
                batch,
                due_batch_size = config.due_batch_size,
                "due counter batch filled; continuing immediately"
            );
        }
    }

    // Every shard gets its cull; the first failure then fails the tick.
    let mut culled = 0u64;
    let mut cull_error = None;
    for shard_id in &config.shard_ids {
        match backend.cull_timers(*shard_id, now).await {
            Ok(count) => culled += count,
            Err(err) => {
                warn!(shard_id, error = %err, "failed to cull timers");
                cull_error.get_or_insert(err);
            }
        }
    }
    if let Some(err) = cull_error {
        return Err(err);
    }

    backend.record_last_run(token, now).await?;

    if assigned > 0 || culled > 0 {
        info!(
            generation = token.generation,
            assigned, culled, "scheduler tick advanced timers"
        );
    }
    Ok((assigned, culled))
}

/// Convenience function to spawn a scheduler task.
pub fn spawn_scheduler<B>(
    backend: B,
    elector: LeaderElector<B>,
    config: SchedulerTaskConfig,
    metrics: Metrics,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>)
where
    B: SchedulerBackend + TimerStore + Clone + Send + Sync + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = SchedulerTask::new(backend, elector, config, metrics, shutdown_rx);
    let handle = tokio::spawn(task.run());
    (handle, shutdown_tx)
}
