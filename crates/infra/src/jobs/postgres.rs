//! Postgres-backed job store (`render_jobs` table).
//!
//! Compare-and-set is a single `UPDATE ... WHERE id = $1 AND version = $n`;
//! the row is locked for the duration of the statement, so concurrent writers
//! racing on the same version leave exactly one winner.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use vidflow_core::{Category, ExpectedVersion, JobId, Priority};
use vidflow_jobs::{ActionKind, Job, JobState};

use crate::config::QueueLimits;
use crate::db::{describe_sqlx_error, is_unique_violation};

use super::store::{JobCounts, JobStore, JobStoreError};

const JOB_COLUMNS: &str = "id, content_ref, category, priority, actions, state, external_handle, \
     result_ref, last_error, retry_count, poll_count, render_timeout_secs, created_at, updated_at, \
     submitted_at, next_poll_at, version";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    limits: QueueLimits,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            limits: QueueLimits::default(),
        }
    }

    pub fn with_queue_limits(mut self, limits: QueueLimits) -> Self {
        self.limits = limits;
        self
    }

    async fn current_version(&self, id: JobId) -> Result<Option<u64>, JobStoreError> {
        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM render_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("current_version", e))?;
        Ok(version.map(|v| v as u64))
    }
}

fn storage(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(describe_sqlx_error(operation, &err))
}

fn actions_json(job: &Job) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(&job.actions)
        .map_err(|e| JobStoreError::Storage(format!("failed to encode job actions: {e}")))
}

#[async_trait]
impl JobStore for PostgresJobStore {
    fn queue_limits(&self) -> QueueLimits {
        self.limits
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let actions = actions_json(&job)?;
        let sql = format!(
            "INSERT INTO render_jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        );

        sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(&job.content_ref)
            .bind(job.category.as_str())
            .bind(i64::from(job.priority.ordinal()))
            .bind(actions)
            .bind(job.state.as_str())
            .bind(job.external_handle.as_deref())
            .bind(job.result_ref.as_deref())
            .bind(job.last_error.as_deref())
            .bind(job.retry_count as i32)
            .bind(job.poll_count as i32)
            .bind(job.render_timeout.map(|t| t.as_secs() as i64))
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.submitted_at)
            .bind(job.next_poll_at)
            .bind(job.version as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    JobStoreError::AlreadyExists(job.id)
                } else {
                    storage("insert_job", e)
                }
            })?;

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM render_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, state = %job.state, expected = %expected), err)]
    async fn compare_and_set(&self, job: Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        let actions = actions_json(&job)?;
        let expected_version = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };

        let sql = format!(
            "UPDATE render_jobs SET \
                content_ref = $2, category = $3, priority = $4, actions = $5, state = $6, \
                external_handle = $7, result_ref = $8, last_error = $9, retry_count = $10, \
                poll_count = $11, render_timeout_secs = $12, updated_at = $13, submitted_at = $14, \
                next_poll_at = $15, version = version + 1 \
             WHERE id = $1 AND ($16::BIGINT IS NULL OR version = $16) \
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(&job.content_ref)
            .bind(job.category.as_str())
            .bind(i64::from(job.priority.ordinal()))
            .bind(actions)
            .bind(job.state.as_str())
            .bind(job.external_handle.as_deref())
            .bind(job.result_ref.as_deref())
            .bind(job.last_error.as_deref())
            .bind(job.retry_count as i32)
            .bind(job.poll_count as i32)
            .bind(job.render_timeout.map(|t| t.as_secs() as i64))
            .bind(job.updated_at)
            .bind(job.submitted_at)
            .bind(job.next_poll_at)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("compare_and_set", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => match self.current_version(job.id).await? {
                None => Err(JobStoreError::NotFound(job.id)),
                Some(actual) => Err(JobStoreError::StaleState {
                    job_id: job.id,
                    expected,
                    actual,
                }),
            },
        }
    }

    #[instrument(skip(self), fields(state = %state), err)]
    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM render_jobs WHERE state = $1 \
             ORDER BY priority DESC, created_at ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage("list_by_state", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn due_for_poll(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM render_jobs \
             WHERE state IN ('submitted', 'polling') AND (next_poll_at IS NULL OR next_poll_at <= $1) \
             ORDER BY next_poll_at ASC NULLS FIRST, created_at ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage("due_for_poll", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(state = %state), err)]
    async fn list_updated_since(
        &self,
        state: JobState,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM render_jobs WHERE state = $1 AND updated_at >= $2 \
             ORDER BY updated_at ASC, created_at ASC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(since)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage("list_updated_since", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn counts(&self) -> Result<JobCounts, JobStoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM render_jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage("counts", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| storage("counts", e))?;
            let n: i64 = row.try_get("n").map_err(|e| storage("counts", e))?;
            let state: JobState = state
                .parse()
                .map_err(|e| JobStoreError::Storage(format!("corrupt job row: {e}")))?;
            counts.add(state, n as usize);
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            "DELETE FROM render_jobs WHERE state IN ('completed', 'failed') AND updated_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| storage("purge_terminal_before", e))?;

        Ok(result.rows_affected())
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let corrupt = |e: String| JobStoreError::Storage(format!("corrupt job row: {e}"));
    let col = |e: sqlx::Error| corrupt(e.to_string());

    let id: Uuid = row.try_get("id").map_err(col)?;
    let category: String = row.try_get("category").map_err(col)?;
    let priority: i64 = row.try_get("priority").map_err(col)?;
    let actions: serde_json::Value = row.try_get("actions").map_err(col)?;
    let state: String = row.try_get("state").map_err(col)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(col)?;
    let poll_count: i32 = row.try_get("poll_count").map_err(col)?;
    let render_timeout_secs: Option<i64> = row.try_get("render_timeout_secs").map_err(col)?;
    let version: i64 = row.try_get("version").map_err(col)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        content_ref: row.try_get("content_ref").map_err(col)?,
        category: Category::new(category).map_err(|e| corrupt(e.to_string()))?,
        priority: Priority::new(u32::try_from(priority).map_err(|e| corrupt(e.to_string()))?),
        actions: serde_json::from_value::<Vec<ActionKind>>(actions).map_err(|e| corrupt(e.to_string()))?,
        state: state.parse().map_err(|e: vidflow_core::DomainError| corrupt(e.to_string()))?,
        external_handle: row.try_get("external_handle").map_err(col)?,
        result_ref: row.try_get("result_ref").map_err(col)?,
        last_error: row.try_get("last_error").map_err(col)?,
        retry_count: retry_count.max(0) as u32,
        poll_count: poll_count.max(0) as u32,
        render_timeout: render_timeout_secs.map(|s| Duration::from_secs(s.max(0) as u64)),
        created_at: row.try_get("created_at").map_err(col)?,
        updated_at: row.try_get("updated_at").map_err(col)?,
        submitted_at: row.try_get("submitted_at").map_err(col)?,
        next_poll_at: row.try_get("next_poll_at").map_err(col)?,
        version: version.max(0) as u64,
    })
}
