//! Postgres-backed job store.
//!
//! Lifecycle rules are enforced in SQL: every mutating statement carries the
//! allowed source statuses in its `WHERE` clause, and counters only move
//! forward through `GREATEST`. When a statement matches no row the job is
//! re-read to tell "unknown job" apart from "illegal transition".

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use super::store::{JobStore, JobStoreError};
use super::types::{
    Finalize, Job, JobFilter, JobId, JobMeta, JobStatus, JobTransitionError, MAX_RUNNING_PROGRESS,
    ProgressUpdate,
};

const JOB_COLUMNS: &str = "id, job_type, status, progress, message, total_rows, processed_rows, \
                           error_message, created_at, started_at, finished_at, meta";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Explain why a guarded update matched nothing.
    async fn rejected(&self, job_id: JobId, to: JobStatus, meta: Option<&JobMeta>) -> JobStoreError {
        match self.get(job_id).await {
            Ok(Some(job)) => {
                let source = match meta {
                    // Status allowed the change, so the meta guard refused it.
                    Some(meta) if job.status.can_transition_to(to) => JobTransitionError::MetaMismatch {
                        job: job.job_type,
                        meta: meta.job_type(),
                    },
                    _ => JobTransitionError::Illegal { from: job.status, to },
                };
                JobStoreError::InvalidTransition { job_id, source }
            }
            Ok(None) => JobStoreError::NotFound(job_id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = job.job_type.as_str()), err)]
    async fn create_job(&self, job: Job) -> Result<Job, JobStoreError> {
        let meta = serde_json::to_value(&job.meta)
            .map_err(|e| JobStoreError::Storage(format!("failed to encode job meta: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, status, progress, message, total_rows, processed_rows,
                error_message, created_at, started_at, finished_at, meta
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.progress)
        .bind(&job.message)
        .bind(job.total_rows.map(to_i64))
        .bind(to_i64(job.processed_rows))
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(meta)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_job", job.id, e))?;

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn start(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'running', started_at = COALESCE(started_at, $2)
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(Utc::now())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("start", job_id, e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.rejected(job_id, JobStatus::Running, None).await),
        }
    }

    #[instrument(skip(self, update), fields(job_id = %job_id, processed_rows = update.processed_rows), err)]
    async fn update_progress(&self, job_id: JobId, update: ProgressUpdate) -> Result<Job, JobStoreError> {
        let meta = encode_meta(update.meta.as_ref())?;
        let sql = format!(
            r#"
            UPDATE jobs
            SET processed_rows = GREATEST(processed_rows, $2),
                total_rows = COALESCE($3::bigint, total_rows),
                progress = GREATEST(progress, LEAST($4::double precision, $5::double precision)),
                message = COALESCE($6::text, message),
                meta = COALESCE($7::jsonb, meta)
            WHERE id = $1 AND status = 'running'
              AND ($7::jsonb IS NULL OR $7->>'type' = job_type)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(to_i64(update.processed_rows))
            .bind(update.total_rows.map(to_i64))
            .bind(update.progress.max(0.0))
            .bind(MAX_RUNNING_PROGRESS)
            .bind(&update.message)
            .bind(meta)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_progress", job_id, e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => match self.get(job_id).await? {
                Some(job) if job.status != JobStatus::Running => Err(JobStoreError::InvalidTransition {
                    job_id,
                    source: JobTransitionError::NotRunning(job.status),
                }),
                Some(job) => Err(JobStoreError::InvalidTransition {
                    job_id,
                    source: JobTransitionError::MetaMismatch {
                        job: job.job_type,
                        meta: update.meta.map(|m| m.job_type()).unwrap_or(job.job_type),
                    },
                }),
                None => Err(JobStoreError::NotFound(job_id)),
            },
        }
    }

    #[instrument(skip(self, fin), fields(job_id = %job_id, status = fin.status.as_str()), err)]
    async fn finalize(&self, job_id: JobId, fin: Finalize) -> Result<Job, JobStoreError> {
        if !fin.status.is_terminal() {
            return Err(JobStoreError::InvalidTransition {
                job_id,
                source: JobTransitionError::NotTerminal(fin.status),
            });
        }
        let allowed_from: Vec<String> = [JobStatus::Pending, JobStatus::Running]
            .into_iter()
            .filter(|from| from.can_transition_to(fin.status))
            .map(|from| from.as_str().to_string())
            .collect();
        let completed = fin.status == JobStatus::Completed;
        let meta = encode_meta(fin.meta.as_ref())?;

        let sql = format!(
            r#"
            UPDATE jobs
            SET status = $2,
                progress = CASE WHEN $3::boolean THEN 1.0 ELSE progress END,
                error_message = CASE WHEN $3::boolean THEN NULL ELSE $4::text END,
                message = COALESCE($5::text, message),
                processed_rows = GREATEST(processed_rows, COALESCE($6::bigint, processed_rows)),
                meta = COALESCE($7::jsonb, meta),
                finished_at = $8
            WHERE id = $1 AND status = ANY($9::text[])
              AND ($7::jsonb IS NULL OR $7->>'type' = job_type)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(fin.status.as_str())
            .bind(completed)
            .bind(&fin.error_message)
            .bind(&fin.message)
            .bind(fin.processed_rows.map(to_i64))
            .bind(meta)
            .bind(Utc::now())
            .bind(allowed_from)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("finalize", job_id, e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.rejected(job_id, fin.status, fin.meta.as_ref()).await),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", job_id, e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR job_type = $2)
              AND ($3::timestamptz IS NULL OR created_at >= $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.job_type.map(|t| t.as_str()))
            .bind(filter.since)
            .bind(filter.limit() as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", JobId::from_uuid(Uuid::nil()), e))?;

        rows.iter().map(job_from_row).collect()
    }
}

fn encode_meta(meta: Option<&JobMeta>) -> Result<Option<serde_json::Value>, JobStoreError> {
    meta.map(serde_json::to_value)
        .transpose()
        .map_err(|e| JobStoreError::Storage(format!("failed to encode job meta: {e}")))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));

    let id: Uuid = row.try_get("id").map_err(decode)?;
    let job_type: String = row.try_get("job_type").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let total_rows: Option<i64> = row.try_get("total_rows").map_err(decode)?;
    let processed_rows: i64 = row.try_get("processed_rows").map_err(decode)?;
    let meta: serde_json::Value = row.try_get("meta").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        job_type: job_type.parse().map_err(JobStoreError::Storage)?,
        status: status.parse().map_err(JobStoreError::Storage)?,
        progress: row.try_get("progress").map_err(decode)?,
        message: row.try_get("message").map_err(decode)?,
        total_rows: total_rows.map(|v| v.max(0) as u64),
        processed_rows: processed_rows.max(0) as u64,
        error_message: row.try_get("error_message").map_err(decode)?,
        created_at,
        started_at: row.try_get("started_at").map_err(decode)?,
        finished_at: row.try_get("finished_at").map_err(decode)?,
        meta: serde_json::from_value(meta)
            .map_err(|e| JobStoreError::Storage(format!("failed to decode job meta: {e}")))?,
    })
}

fn map_sqlx_error(operation: &str, job_id: JobId, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                return JobStoreError::AlreadyExists(job_id);
            }
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed during {operation}")),
        other => JobStoreError::Storage(format!("{operation} failed: {other}")),
    }
}
