use chrono::{DateTime, Utc};
use tonic::async_trait;

use super::PostgresBackend;
use crate::backends::base::{BackendResult, WorkerRecord, WorkerStatusBackend};

#[derive(sqlx::FromRow)]
struct WorkerRow {
    identity: String,
    started_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

#[async_trait]
impl WorkerStatusBackend for PostgresBackend {
    async fn upsert_worker(&self, identity: &str, now: DateTime<Utc>) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (identity, started_at, last_seen_at)
            VALUES ($1, $2, $2)
            ON CONFLICT (identity)
            DO UPDATE SET last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(identity)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_workers(&self) -> BackendResult<Vec<WorkerRecord>> {
        let rows = sqlx::query_as::<_, WorkerRow>(
            "SELECT identity, started_at, last_seen_at FROM workers ORDER BY identity",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| WorkerRecord {
                identity: row.identity,
                started_at: row.started_at,
                last_seen_at: row.last_seen_at,
            })
            .collect())
    }
}
