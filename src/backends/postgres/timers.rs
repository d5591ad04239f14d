use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tonic::async_trait;
use uuid::Uuid;

use super::{PostgresBackend, retry_transient_backend};
use crate::backends::base::{BackendResult, ClaimRequest, TimerQuery, TimerStore};
use crate::timer::{NewTimer, RpcTarget, Timer, TimerId};

const TIMER_COLUMNS: &str = r#"
    id, name, shard_key, shard_id, labels, created_at, due_at, due_counter, priority,
    assigned_worker, assignable_at, attempt, retry_counter,
    rpc_addr, rpc_authority, rpc_method, rpc_meta, rpc_args_type_url, rpc_args_data,
    rpc_return_type_url, delivered_at, delivered_status_code, delivered_err
"#;

#[derive(sqlx::FromRow)]
struct TimerRow {
    id: Uuid,
    name: String,
    shard_key: String,
    shard_id: i32,
    labels: Json<HashMap<String, String>>,
    created_at: DateTime<Utc>,
    due_at: DateTime<Utc>,
    due_counter: Option<i64>,
    priority: i32,
    assigned_worker: Option<String>,
    assignable_at: Option<DateTime<Utc>>,
    attempt: i32,
    retry_counter: i32,
    rpc_addr: String,
    rpc_authority: String,
    rpc_method: String,
    rpc_meta: Json<HashMap<String, String>>,
    rpc_args_type_url: String,
    rpc_args_data: Vec<u8>,
    rpc_return_type_url: String,
    delivered_at: Option<DateTime<Utc>>,
    delivered_status_code: Option<i32>,
    delivered_err: Option<String>,
}

impl From<TimerRow> for Timer {
    fn from(row: TimerRow) -> Self {
        Self {
            id: TimerId(row.id),
            name: row.name,
            shard_key: row.shard_key,
            shard_id: row.shard_id,
            labels: row.labels.0,
            created_at: row.created_at,
            due_at: row.due_at,
            due_counter: row.due_counter,
            priority: row.priority,
            assigned_worker: row.assigned_worker,
            assignable_at: row.assignable_at,
            attempt: row.attempt,
            retry_counter: row.retry_counter,
            target: RpcTarget {
                addr: row.rpc_addr,
                authority: row.rpc_authority,
                method: row.rpc_method,
                meta: row.rpc_meta.0,
                args_type_url: row.rpc_args_type_url,
                args_data: row.rpc_args_data,
                return_type_url: row.rpc_return_type_url,
            },
            delivered_at: row.delivered_at,
            delivered_status_code: row.delivered_status_code,
            delivered_err: row.delivered_err,
        }
    }
}

#[async_trait]
impl TimerStore for PostgresBackend {
    #[tracing::instrument(skip_all, fields(name = %timer.name, shard_id = timer.shard_id))]
    async fn create_timer(&self, timer: NewTimer) -> BackendResult<Timer> {
        timer.validate()?;
        let query = format!(
            r#"
            INSERT INTO timers
                (id, name, shard_key, shard_id, labels, due_at, priority,
                 rpc_addr, rpc_authority, rpc_method, rpc_meta, rpc_args_type_url,
                 rpc_args_data, rpc_return_type_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {TIMER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, TimerRow>(&query)
            .bind(TimerId::new().0)
            .bind(&timer.name)
            .bind(&timer.shard_key)
            .bind(timer.shard_id)
            .bind(Json(&timer.labels))
            .bind(timer.due_at)
            .bind(timer.priority)
            .bind(&timer.target.addr)
            .bind(&timer.target.authority)
            .bind(&timer.target.method)
            .bind(Json(&timer.target.meta))
            .bind(&timer.target.args_type_url)
            .bind(&timer.target.args_data)
            .bind(&timer.target.return_type_url)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn get_timer(&self, id: TimerId) -> BackendResult<Option<Timer>> {
        let query = format!("SELECT {TIMER_COLUMNS} FROM timers WHERE id = $1");
        let row = sqlx::query_as::<_, TimerRow>(&query)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_timers(&self, query: &TimerQuery) -> BackendResult<Vec<Timer>> {
        let limit = if query.limit == 0 {
            i64::MAX
        } else {
            query.limit as i64
        };
        let sql = format!(
            r#"
            SELECT {TIMER_COLUMNS}
            FROM timers
            WHERE ($1::INTEGER IS NULL OR shard_id = $1)
              AND labels @> $3::JSONB
            ORDER BY created_at, id
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, TimerRow>(&sql)
            .bind(query.shard_id)
            .bind(limit)
            .bind(Json(&query.labels))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_timer(&self, id: TimerId) -> BackendResult<bool> {
        let result = sqlx::query("DELETE FROM timers WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lease due timers with the `FOR UPDATE SKIP LOCKED` claim pattern so
    /// concurrent workers partition the backlog instead of blocking.
    #[tracing::instrument(skip_all, fields(shard_id = claim.shard_id, worker = %claim.worker))]
    async fn claim_timers(&self, claim: &ClaimRequest) -> BackendResult<Vec<Timer>> {
        if claim.batch_size == 0 {
            return Ok(Vec::new());
        }
        let lease_expires_at = claim.lease_expires_at();
        let sql = format!(
            r#"
            WITH claimed AS (
                SELECT id
                FROM timers
                WHERE shard_id = $1
                  AND due_at <= $2
                  AND delivered_at IS NULL
                  AND attempt < $3
                  AND (assignable_at IS NULL OR assignable_at < $2)
                ORDER BY due_counter ASC NULLS LAST, due_at, id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE timers AS t
            SET assigned_worker = $5,
                attempt = t.attempt + 1,
                assignable_at = $6
            FROM claimed
            WHERE t.id = claimed.id
            RETURNING {}
            "#,
            prefixed_columns("t")
        );

        let mut timers: Vec<Timer> = retry_transient_backend("claim_timers", || {
            let sql = &sql;
            async move {
                let mut tx = self.pool.begin().await?;
                let rows = sqlx::query_as::<_, TimerRow>(sql)
                    .bind(claim.shard_id)
                    .bind(claim.now)
                    .bind(self.max_attempts)
                    .bind(claim.batch_size as i64)
                    .bind(&claim.worker)
                    .bind(lease_expires_at)
                    .fetch_all(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(rows)
            }
        })
        .await?
        .into_iter()
        .map(Timer::from)
        .collect();

        // RETURNING does not preserve the CTE order.
        timers.sort_by(|a, b| {
            (a.due_counter.is_none(), a.due_counter, a.due_at, a.id)
                .cmp(&(b.due_counter.is_none(), b.due_counter, b.due_at, b.id))
        });
        Ok(timers)
    }

    async fn mark_delivered(&self, id: TimerId, now: DateTime<Utc>) -> BackendResult<()> {
        retry_transient_backend("mark_delivered", || async move {
            sqlx::query(
                r#"
                UPDATE timers
                SET delivered_at = $2,
                    delivered_status_code = 0,
                    delivered_err = NULL,
                    assignable_at = NULL
                WHERE id = $1 AND delivered_at IS NULL
                "#,
            )
            .bind(id.0)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn mark_attempted(
        &self,
        claimed: &Timer,
        status_code: i32,
        error: &str,
    ) -> BackendResult<bool> {
        let Some(worker) = claimed.assigned_worker.as_deref() else {
            return Ok(false);
        };
        let (id, attempt) = (claimed.id, claimed.attempt);
        retry_transient_backend("mark_attempted", || async move {
            let result = sqlx::query(
                r#"
                UPDATE timers
                SET retry_counter = retry_counter + 1,
                    delivered_status_code = $4,
                    delivered_err = $5,
                    assignable_at = NULL
                WHERE id = $1
                  AND delivered_at IS NULL
                  AND assigned_worker = $2
                  AND attempt = $3
                "#,
            )
            .bind(id.0)
            .bind(worker)
            .bind(attempt)
            .bind(status_code)
            .bind(error)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn cull_timers(&self, shard_id: i32, now: DateTime<Utc>) -> BackendResult<u64> {
        let max_attempts = self.max_attempts;
        retry_transient_backend("cull_timers", || async move {
            let result = sqlx::query(
                r#"
                DELETE FROM timers
                WHERE id IN (
                    SELECT id
                    FROM timers
                    WHERE shard_id = $1
                      AND (
                        delivered_at IS NOT NULL
                        OR (attempt >= $2 AND (assignable_at IS NULL OR assignable_at < $3))
                      )
                    FOR UPDATE SKIP LOCKED
                )
                "#,
            )
            .bind(shard_id)
            .bind(max_attempts)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}

fn prefixed_columns(alias: &str) -> String {
    TIMER_COLUMNS
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
