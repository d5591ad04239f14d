use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use tonic::async_trait;

use super::{PostgresBackend, retry_transient_backend};
use crate::backends::base::{
    BackendResult, FencingToken, LeaderRecord, SchedulerBackend, SchedulerLastRun,
};

/// Lock the leadership row in share mode and fail with `Fenced` unless it
/// still names `token`. Must run inside the transaction that performs the write.
async fn check_fence(
    tx: &mut Transaction<'_, Postgres>,
    token: &FencingToken,
) -> BackendResult<()> {
    let row = sqlx::query(
        r#"
        SELECT 1
        FROM scheduler_leader
        WHERE namespace = $1 AND generation = $2 AND leader = $3
        FOR SHARE
        "#,
    )
    .bind(&token.namespace)
    .bind(token.generation)
    .bind(&token.holder)
    .fetch_optional(&mut **tx)
    .await?;
    match row {
        Some(_) => Ok(()),
        None => Err(token.fenced()),
    }
}

#[async_trait]
impl SchedulerBackend for PostgresBackend {
    async fn read_leader(&self, namespace: &str) -> BackendResult<LeaderRecord> {
        let row = sqlx::query(
            r#"
            SELECT generation, leader, last_seen_at
            FROM scheduler_leader
            WHERE namespace = $1
            "#,
        )
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => LeaderRecord {
                namespace: namespace.to_string(),
                generation: row.get("generation"),
                leader: row.get("leader"),
                last_seen_at: row.get("last_seen_at"),
            },
            None => LeaderRecord::vacant(namespace),
        })
    }

    #[tracing::instrument(skip(self, observed), fields(namespace = %observed.namespace, observed_generation = observed.generation))]
    async fn try_acquire_leadership(
        &self,
        observed: &LeaderRecord,
        candidate: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<Option<LeaderRecord>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO scheduler_leader (namespace, generation, leader, last_seen_at)
            VALUES ($1, 0, NULL, NULL)
            ON CONFLICT (namespace) DO NOTHING
            "#,
        )
        .bind(&observed.namespace)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            UPDATE scheduler_leader
            SET generation = generation + 1,
                leader = $5,
                last_seen_at = $6
            WHERE namespace = $1
              AND generation = $2
              AND leader IS NOT DISTINCT FROM $3
              AND last_seen_at IS NOT DISTINCT FROM $4
            RETURNING generation
            "#,
        )
        .bind(&observed.namespace)
        .bind(observed.generation)
        .bind(&observed.leader)
        .bind(observed.last_seen_at)
        .bind(candidate)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(row.map(|row| LeaderRecord {
            namespace: observed.namespace.clone(),
            generation: row.get("generation"),
            leader: Some(candidate.to_string()),
            last_seen_at: Some(now),
        }))
    }

    async fn renew_leadership(
        &self,
        token: &FencingToken,
        now: DateTime<Utc>,
    ) -> BackendResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_leader
            SET last_seen_at = $4
            WHERE namespace = $1 AND generation = $2 AND leader = $3
            "#,
        )
        .bind(&token.namespace)
        .bind(token.generation)
        .bind(&token.holder)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, token), fields(generation = token.generation))]
    async fn assign_due_counters(
        &self,
        token: &FencingToken,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<usize> {
        if limit == 0 {
            return Ok(0);
        }
        retry_transient_backend("assign_due_counters", || async move {
            let mut tx = self.pool.begin().await?;
            check_fence(&mut tx, token).await?;
            let result = sqlx::query(
                r#"
                WITH pending AS (
                    SELECT id, due_at, created_at
                    FROM timers
                    WHERE due_counter IS NULL
                      AND due_at <= $1
                    ORDER BY due_at, created_at, id
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                ),
                numbered AS (
                    SELECT id, nextval('timers_due_counter_seq') AS counter
                    FROM (SELECT id FROM pending ORDER BY due_at, created_at, id) AS p
                )
                UPDATE timers AS t
                SET due_counter = numbered.counter
                FROM numbered
                WHERE t.id = numbered.id
                "#,
            )
            .bind(now)
            .bind(limit as i64)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(result.rows_affected() as usize)
        })
        .await
    }

    async fn record_last_run(
        &self,
        token: &FencingToken,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        let mut tx = self.pool.begin().await?;
        check_fence(&mut tx, token).await?;
        sqlx::query(
            r#"
            INSERT INTO scheduler_last_run (namespace, worker, last_run_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (namespace)
            DO UPDATE SET worker = EXCLUDED.worker, last_run_at = EXCLUDED.last_run_at
            "#,
        )
        .bind(&token.namespace)
        .bind(&token.holder)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn last_run(&self, namespace: &str) -> BackendResult<Option<SchedulerLastRun>> {
        let row = sqlx::query(
            "SELECT worker, last_run_at FROM scheduler_last_run WHERE namespace = $1",
        )
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| SchedulerLastRun {
            namespace: namespace.to_string(),
            worker: row.get("worker"),
            last_run_at: row.get("last_run_at"),
        }))
    }
}
