//! Backend interfaces for persisting timers and scheduler coordination state.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tonic::async_trait;

use crate::timer::{NewTimer, Timer, TimerId, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A leader-only write carried a generation that is no longer current.
    #[error("write fenced: generation {generation} is no longer leader of `{namespace}`")]
    Fenced { namespace: String, generation: i64 },
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Clone, Debug)]
/// Parameters for one atomic claim of due timers.
pub struct ClaimRequest {
    pub shard_id: i32,
    pub worker: String,
    pub now: DateTime<Utc>,
    pub batch_size: usize,
    pub lease: Duration,
}

impl ClaimRequest {
    pub fn lease_expires_at(&self) -> DateTime<Utc> {
        self.now + chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::zero())
    }
}

#[derive(Clone, Debug, Default)]
/// Read filter for listing timers. Synthetic selector keys (see
/// [`crate::timer::SYNTHETIC_LABELS`]) are applied by callers against
/// [`Timer::match_labels`].
pub struct TimerQuery {
    pub shard_id: Option<i32>,
    /// User labels a timer must carry with exactly these values.
    pub labels: HashMap<String, String>,
    /// Zero means no limit.
    pub limit: usize,
}

/// Timer row lifecycle: create, claim, outcome recording and culling.
#[async_trait]
pub trait TimerStore: Send + Sync {
    async fn create_timer(&self, timer: NewTimer) -> BackendResult<Timer>;

    async fn get_timer(&self, id: TimerId) -> BackendResult<Option<Timer>>;

    async fn list_timers(&self, query: &TimerQuery) -> BackendResult<Vec<Timer>>;

    /// Returns whether a row was removed.
    async fn delete_timer(&self, id: TimerId) -> BackendResult<bool>;

    /// Lease up to `batch_size` due timers of one shard to `worker`.
    ///
    /// Rows already locked by a concurrent claimer are skipped, never waited on.
    /// Returned timers are in `due_counter` order with `attempt` already bumped.
    async fn claim_timers(&self, claim: &ClaimRequest) -> BackendResult<Vec<Timer>>;

    /// Record a successful delivery. A second call for the same id is a no-op.
    async fn mark_delivered(&self, id: TimerId, now: DateTime<Utc>) -> BackendResult<()>;

    /// Record a failed delivery of `claimed` and release its lease.
    ///
    /// Only applies while the row still carries the lease `claimed` was returned
    /// with (same `assigned_worker` and `attempt`). A report from a worker whose
    /// lease was already reclaimed is dropped so the live lease stays intact.
    /// Returns whether the row was updated.
    async fn mark_attempted(
        &self,
        claimed: &Timer,
        status_code: i32,
        error: &str,
    ) -> BackendResult<bool>;

    /// Delete delivered timers and unleased timers that exhausted their attempts.
    async fn cull_timers(&self, shard_id: i32, now: DateTime<Utc>) -> BackendResult<u64>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Snapshot of the leadership row for a scheduling namespace.
pub struct LeaderRecord {
    pub namespace: String,
    pub generation: i64,
    pub leader: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl LeaderRecord {
    pub fn vacant(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            generation: 0,
            leader: None,
            last_seen_at: None,
        }
    }

    /// No holder, or the holder stopped heartbeating more than `timeout` ago.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        match (&self.leader, self.last_seen_at) {
            (Some(_), Some(last_seen_at)) => now - last_seen_at > timeout,
            _ => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Proof of leadership attached to every leader-only write.
pub struct FencingToken {
    pub namespace: String,
    pub holder: String,
    pub generation: i64,
}

impl FencingToken {
    pub(crate) fn fenced(&self) -> BackendError {
        BackendError::Fenced {
            namespace: self.namespace.clone(),
            generation: self.generation,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerLastRun {
    pub namespace: String,
    pub worker: String,
    pub last_run_at: DateTime<Utc>,
}

/// Leader election and leader-only bookkeeping.
#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    async fn read_leader(&self, namespace: &str) -> BackendResult<LeaderRecord>;

    /// Compare-and-swap leadership from `observed` to `candidate`, bumping the
    /// generation. Returns `None` when the row changed since it was read.
    async fn try_acquire_leadership(
        &self,
        observed: &LeaderRecord,
        candidate: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<Option<LeaderRecord>>;

    /// Refresh `last_seen_at`. Returns `false` once the token is stale.
    async fn renew_leadership(&self, token: &FencingToken, now: DateTime<Utc>)
        -> BackendResult<bool>;

    /// Number due timers that have no `due_counter` yet, oldest first.
    async fn assign_due_counters(
        &self,
        token: &FencingToken,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<usize>;

    async fn record_last_run(&self, token: &FencingToken, now: DateTime<Utc>)
        -> BackendResult<()>;

    async fn last_run(&self, namespace: &str) -> BackendResult<Option<SchedulerLastRun>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerRecord {
    pub identity: String,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Heartbeat registry of delivery workers.
#[async_trait]
pub trait WorkerStatusBackend: Send + Sync {
    async fn upsert_worker(&self, identity: &str, now: DateTime<Utc>) -> BackendResult<()>;

    async fn list_workers(&self) -> BackendResult<Vec<WorkerRecord>>;
}
