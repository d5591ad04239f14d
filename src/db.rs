//! Pool construction and schema migrations for the Postgres backend.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use crate::backends::{BackendError, BackendResult};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a pool of at most `max_connections` connections.
pub async fn connect(dsn: &str, max_connections: u32) -> BackendResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(dsn)
        .await?;
    debug!(max_connections, "postgres pool ready");
    Ok(pool)
}

/// Apply `migrations/` in order; already applied versions are skipped.
pub async fn run_migrations(pool: &PgPool) -> BackendResult<()> {
    sqlx::migrate!()
        .run(pool)
        .await
        .map_err(|err| BackendError::Message(format!("schema migration failed: {err}")))
}
