//! Postgres-backed deduplication tracker (`dedup_records` table).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, instrument};

use vidflow_core::Category;
use vidflow_jobs::retention_cutoff;

use crate::db::describe_sqlx_error;

use super::{DedupError, DedupPolicy, DedupTracker};

#[derive(Debug, Clone)]
pub struct PostgresDedupTracker {
    pool: PgPool,
    policy: DedupPolicy,
}

impl PostgresDedupTracker {
    pub fn new(pool: PgPool, policy: DedupPolicy) -> Self {
        Self { pool, policy }
    }

    /// Over the category cap, drop records that already left the window.
    /// Records inside the window are never trimmed.
    async fn trim(&self, category: &Category, now: DateTime<Utc>) -> Result<u64, DedupError> {
        let result = sqlx::query(
            r#"
            DELETE FROM dedup_records
            WHERE category = $1 AND admitted_at <= $3 AND identifier IN (
                SELECT identifier FROM dedup_records
                WHERE category = $1
                ORDER BY admitted_at DESC, identifier DESC
                OFFSET $2
            )
            "#,
        )
        .bind(category.as_str())
        .bind(self.policy.max_per_category as i64)
        .bind(retention_cutoff(now, self.policy.retention))
        .execute(&self.pool)
        .await
        .map_err(|e| storage("trim", e))?;

        Ok(result.rows_affected())
    }
}

fn storage(operation: &str, err: sqlx::Error) -> DedupError {
    DedupError::Storage(describe_sqlx_error(operation, &err))
}

#[async_trait]
impl DedupTracker for PostgresDedupTracker {
    /// The conditional upsert makes the check and the write one statement:
    /// a fresh row conflicts and is left untouched (no row returned), an
    /// expired one is refreshed (row returned).
    #[instrument(skip(self), fields(category = %category), err)]
    async fn admit(&self, category: &Category, identifier: &str, now: DateTime<Utc>) -> Result<bool, DedupError> {
        let admitted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO dedup_records (category, identifier, admitted_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (category, identifier) DO UPDATE
                SET admitted_at = EXCLUDED.admitted_at
                WHERE dedup_records.admitted_at <= $4
            RETURNING identifier
            "#,
        )
        .bind(category.as_str())
        .bind(identifier)
        .bind(now)
        .bind(retention_cutoff(now, self.policy.retention))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage("admit", e))?;

        if admitted.is_none() {
            return Ok(false);
        }

        let trimmed = self.trim(category, now).await?;
        if trimmed > 0 {
            debug!(%category, trimmed, "trimmed expired dedup records over the category cap");
        }
        Ok(true)
    }

    async fn recent(&self, category: &Category, limit: usize) -> Result<Vec<String>, DedupError> {
        sqlx::query_scalar(
            r#"
            SELECT identifier FROM dedup_records
            WHERE category = $1
            ORDER BY admitted_at DESC, identifier DESC
            LIMIT $2
            "#,
        )
        .bind(category.as_str())
        .bind(limit.min(self.policy.max_per_category) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage("recent", e))
    }

    #[instrument(skip(self), fields(category = %category), err)]
    async fn forget(&self, category: &Category, identifier: &str) -> Result<bool, DedupError> {
        let result = sqlx::query("DELETE FROM dedup_records WHERE category = $1 AND identifier = $2")
            .bind(category.as_str())
            .bind(identifier)
            .execute(&self.pool)
            .await
            .map_err(|e| storage("forget", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DedupError> {
        let result = sqlx::query("DELETE FROM dedup_records WHERE admitted_at <= $1")
            .bind(retention_cutoff(now, self.policy.retention))
            .execute(&self.pool)
            .await
            .map_err(|e| storage("purge_expired", e))?;

        Ok(result.rows_affected())
    }

    async fn clear_category(&self, category: &Category) -> Result<u64, DedupError> {
        let result = sqlx::query("DELETE FROM dedup_records WHERE category = $1")
            .bind(category.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| storage("clear_category", e))?;

        Ok(result.rows_affected())
    }
}
