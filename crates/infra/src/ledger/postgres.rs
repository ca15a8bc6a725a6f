//! Postgres-backed action ledger (`action_records` table).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use vidflow_core::JobId;
use vidflow_jobs::{ActionId, ActionOutcome, ActionRecord};

use crate::db::describe_sqlx_error;

use super::{ActionLedger, Claim, LedgerError};

const RECORD_COLUMNS: &str = "job_id, action_id, status, message, attempts, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresActionLedger {
    pool: PgPool,
}

impl PostgresActionLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage(operation: &str, err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(describe_sqlx_error(operation, &err))
}

#[async_trait]
impl ActionLedger for PostgresActionLedger {
    async fn get(&self, job_id: JobId, action_id: &ActionId) -> Result<Option<ActionRecord>, LedgerError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM action_records WHERE job_id = $1 AND action_id = $2");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(action_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("get_action", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<ActionRecord>, LedgerError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM action_records WHERE job_id = $1 ORDER BY action_id");
        let rows = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage("list_actions", e))?;

        rows.iter().map(record_from_row).collect()
    }

    /// One conditional upsert: a new row, or a takeover of a failed or stale
    /// claim, returns the row; anything else leaves it untouched and returns
    /// nothing, after which the existing row says why.
    #[instrument(skip(self), fields(job_id = %job_id, action = %action_id), err)]
    async fn try_claim(
        &self,
        job_id: JobId,
        action_id: &ActionId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Claim, LedgerError> {
        let stale_before = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or(DateTime::UNIX_EPOCH);

        let sql = format!(
            "INSERT INTO action_records ({RECORD_COLUMNS}) \
             VALUES ($1, $2, 'in_progress', NULL, 0, $3, $3) \
             ON CONFLICT (job_id, action_id) DO UPDATE \
                SET status = 'in_progress', message = NULL, updated_at = EXCLUDED.updated_at \
                WHERE action_records.status = 'failed' \
                   OR (action_records.status = 'in_progress' AND action_records.updated_at <= $4) \
             RETURNING {RECORD_COLUMNS}"
        );

        let claimed = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(action_id.as_str())
            .bind(now)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("try_claim", e))?;

        if let Some(row) = claimed {
            return record_from_row(&row).map(Claim::Acquired);
        }

        let existing = self.get(job_id, action_id).await?.ok_or_else(|| {
            LedgerError::Storage(format!("action record {job_id}/{action_id} vanished during claim"))
        })?;

        Ok(if existing.is_succeeded() {
            Claim::AlreadySucceeded(existing)
        } else {
            Claim::InFlight(existing)
        })
    }

    #[instrument(skip(self, outcome), fields(job_id = %job_id, action = %action_id, status = outcome.as_str()), err)]
    async fn finish(
        &self,
        job_id: JobId,
        action_id: &ActionId,
        outcome: ActionOutcome,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<ActionRecord, LedgerError> {
        let sql = format!(
            "UPDATE action_records SET status = $3, message = $4, attempts = $5, updated_at = $6 \
             WHERE job_id = $1 AND action_id = $2 \
             RETURNING {RECORD_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(action_id.as_str())
            .bind(outcome.as_str())
            .bind(outcome.message())
            .bind(attempts as i32)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("finish_action", e))?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(LedgerError::NotClaimed {
                job_id,
                action_id: action_id.clone(),
            }),
        }
    }
}

fn record_from_row(row: &PgRow) -> Result<ActionRecord, LedgerError> {
    let corrupt = |e: String| LedgerError::Storage(format!("corrupt action row: {e}"));
    let col = |e: sqlx::Error| corrupt(e.to_string());

    let job_id: Uuid = row.try_get("job_id").map_err(col)?;
    let action_id: String = row.try_get("action_id").map_err(col)?;
    let status: String = row.try_get("status").map_err(col)?;
    let message: Option<String> = row.try_get("message").map_err(col)?;
    let attempts: i32 = row.try_get("attempts").map_err(col)?;

    Ok(ActionRecord {
        job_id: JobId::from_uuid(job_id),
        action_id: ActionId::new(action_id),
        outcome: ActionOutcome::from_parts(&status, message).map_err(|e| corrupt(e.to_string()))?,
        attempts: attempts.max(0) as u32,
        created_at: row.try_get("created_at").map_err(col)?,
        updated_at: row.try_get("updated_at").map_err(col)?,
    })
}
