//! Postgres backend for timers, scheduler coordination and worker heartbeats.

mod scheduler;
mod timers;
mod workers;

use std::future::Future;
use std::time::Duration as StdDuration;

use sqlx::PgPool;
use tracing::warn;

use crate::db;
use crate::timer::DEFAULT_MAX_ATTEMPTS;

use super::base::{BackendError, BackendResult};

/// SQLSTATEs worth re-running: deadlock_detected and serialization_failure.
const TRANSIENT_SQLSTATES: [&str; 2] = ["40P01", "40001"];

/// Bounded exponential backoff for transient write conflicts.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    retries: usize,
    first_backoff: StdDuration,
    max_backoff: StdDuration,
}

const TRANSIENT_RETRY: RetryPolicy = RetryPolicy {
    retries: 3,
    first_backoff: StdDuration::from_millis(25),
    max_backoff: StdDuration::from_millis(250),
};

/// Persist timers and scheduler state in Postgres.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    max_attempts: i32,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Connect, run migrations and wrap the pool.
    #[tracing::instrument(skip_all)]
    pub async fn connect(dsn: &str, max_connections: u32) -> BackendResult<Self> {
        let pool = db::connect(dsn, max_connections).await?;
        db::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_transient(err: &BackendError) -> bool {
    match err {
        BackendError::Sqlx(sqlx::Error::Database(db_err)) => db_err
            .code()
            .is_some_and(|code| TRANSIENT_SQLSTATES.iter().any(|state| &*code == *state)),
        // Errors flattened to text by a lower layer keep only the server message.
        BackendError::Message(message) => {
            message.contains("deadlock detected")
                || message.contains("could not serialize access")
        }
        _ => false,
    }
}

impl RetryPolicy {
    fn backoff(&self, retry: usize) -> StdDuration {
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        self.first_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    async fn run<T, Op, Fut>(&self, operation: &'static str, mut op: Op) -> BackendResult<T>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let mut retry = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if retry >= self.retries || !is_transient(&err) {
                return Err(err);
            }
            let delay = self.backoff(retry);
            retry += 1;
            warn!(
                operation,
                retry,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "write conflict, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Run `op`, re-running it on deadlocks and serialization failures.
pub(super) async fn retry_transient_backend<T, Op, Fut>(
    operation: &'static str,
    op: Op,
) -> BackendResult<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    TRANSIENT_RETRY.run(operation, op).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn conflict() -> BackendError {
        BackendError::Message("ERROR: deadlock detected".to_string())
    }

    #[test]
    fn only_write_conflicts_are_transient() {
        assert!(is_transient(&conflict()));
        assert!(is_transient(&BackendError::Message(
            "could not serialize access due to concurrent update".to_string()
        )));
        assert!(!is_transient(&BackendError::Message(
            "duplicate key value violates unique constraint".to_string()
        )));
        assert!(!is_transient(&BackendError::Sqlx(sqlx::Error::RowNotFound)));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let delays: Vec<u128> = (0..5)
            .map(|retry| TRANSIENT_RETRY.backoff(retry).as_millis())
            .collect();
        assert_eq!(delays, [25, 50, 100, 200, 250]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_retry_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result: BackendResult<()> = retry_transient_backend("claim_timers", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), TRANSIENT_RETRY.retries + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result: BackendResult<()> = retry_transient_backend("mark_delivered", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Message("relation does not exist".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_once_the_conflict_clears() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = retry_transient_backend("mark_attempted", || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(conflict());
                }
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.expect("recovered"), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
