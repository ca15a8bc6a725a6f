//! Postgres connection and schema wiring.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

const SCHEMA: &str = include_str!("../migrations/0001_pipeline.sql");

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
}

/// Create the pipeline tables if they do not exist yet. Safe to run on every start.
pub async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Map a sqlx error to a storage message tagged with the failing operation.
pub(crate) fn describe_sqlx_error(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => {
            format!("database error in {}: {}", operation, db_err.message())
        }
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        sqlx::Error::PoolTimedOut => format!("connection pool timed out in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    }
}

/// Whether the error is a unique constraint violation (`23505`).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}
