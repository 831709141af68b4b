//! PostgreSQL job store.
//!
//! Uses runtime-checked queries (`sqlx::query_as`) so the crate builds
//! without a live database. The state-machine guard is a conditional
//! `UPDATE ... WHERE status_id = $expected`; zero affected rows means
//! the guard lost, and the record is reloaded to report the observed
//! status. Checkpoint append order is enforced by a counted insert on
//! `job_checkpoints(job_id, step_index)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use mirage_core::job::{GenerationKind, GenerationParams, Job};
use mirage_core::state_machine::{JobStatus, StaleTransition};
use mirage_core::steps::{StepCheckpoint, StepResult};
use mirage_core::types::{JobId, OwnerId};

use crate::{validate_update_status, JobStore, JobUpdate, StoreError};

/// Convenience alias for the shared connection pool.
pub type DbPool = PgPool;

/// Embedded migrations from `crates/db/migrations`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Run embedded migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}

/// Cheap connectivity probe for startup and health checks.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await?;
    Ok(())
}

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, owner_id, kind, status_id, prompt, negative_prompt, params, \
    provider_correlation_id, output_url, thumbnail_url, error_message, \
    created_at, processing_started_at, completed_at";

/// A row from the `jobs` table, converted to the domain [`Job`] via
/// [`JobRow::into_job`].
#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    owner_id: Uuid,
    kind: String,
    status_id: i16,
    prompt: String,
    negative_prompt: Option<String>,
    params: serde_json::Value,
    provider_correlation_id: Option<String>,
    output_url: Option<String>,
    thumbnail_url: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    processing_started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_job(self) -> Result<Job, StoreError> {
        let kind = GenerationKind::parse(&self.kind).ok_or_else(|| {
            StoreError::Serialization(format!("unknown generation kind '{}'", self.kind))
        })?;
        let status = JobStatus::from_id(self.status_id).ok_or_else(|| {
            StoreError::Serialization(format!("unknown status id {}", self.status_id))
        })?;
        let params: GenerationParams = serde_json::from_value(self.params)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        Ok(Job {
            id: self.id,
            owner_id: self.owner_id,
            kind,
            status,
            prompt: self.prompt,
            negative_prompt: self.negative_prompt,
            params,
            provider_correlation_id: self.provider_correlation_id,
            output_url: self.output_url,
            thumbnail_url: self.thumbnail_url,
            error_message: self.error_message,
            created_at: self.created_at,
            processing_started_at: self.processing_started_at,
            completed_at: self.completed_at,
        })
    }
}

/// A row from the `job_checkpoints` table.
#[derive(Debug, FromRow)]
struct CheckpointRow {
    result: serde_json::Value,
    recorded_at: DateTime<Utc>,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<StepCheckpoint, StoreError> {
        let result: StepResult = serde_json::from_value(self.result)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(StepCheckpoint {
            step: result.step(),
            result,
            recorded_at: self.recorded_at,
        })
    }
}

/// PostgreSQL-backed [`JobStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch_row(&self, id: JobId) -> Result<Option<JobRow>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        Ok(sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let params = serde_json::to_value(&job.params)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            "INSERT INTO jobs \
                 (id, owner_id, kind, status_id, prompt, negative_prompt, params, \
                  provider_correlation_id, output_url, thumbnail_url, error_message, \
                  created_at, processing_started_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(job.id)
        .bind(job.owner_id)
        .bind(job.kind.as_str())
        .bind(job.status.id())
        .bind(&job.prompt)
        .bind(&job.negative_prompt)
        .bind(params)
        .bind(&job.provider_correlation_id)
        .bind(&job.output_url)
        .bind(&job.thumbnail_url)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.processing_started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        match self.fetch_row(id).await? {
            Some(row) => Ok(Some(row.into_job()?)),
            None => Ok(None),
        }
    }

    async fn update_if_status(
        &self,
        id: JobId,
        expected: JobStatus,
        update: JobUpdate,
    ) -> Result<Job, StoreError> {
        validate_update_status(expected, &update)?;

        // Build the SET clause and track the next bind parameter index.
        // $1 = id, $2 = expected status id.
        let mut clauses: Vec<String> = Vec::new();
        let mut bind_idx: u32 = 3;

        if update.status.is_some() {
            clauses.push(format!("status_id = ${bind_idx}"));
            bind_idx += 1;
        }
        if update.provider_correlation_id.is_some() {
            clauses.push(format!("provider_correlation_id = ${bind_idx}"));
            bind_idx += 1;
        }
        if update.output_url.is_some() {
            clauses.push(format!("output_url = ${bind_idx}"));
            bind_idx += 1;
        }
        if update.thumbnail_url.is_some() {
            clauses.push(format!("thumbnail_url = ${bind_idx}"));
            bind_idx += 1;
        }
        if update.error_message.is_some() {
            clauses.push(format!("error_message = ${bind_idx}"));
            bind_idx += 1;
        }
        if update.processing_started_at.is_some() {
            // Transition timestamps are never rewritten.
            clauses.push(format!(
                "processing_started_at = COALESCE(processing_started_at, ${bind_idx})"
            ));
            bind_idx += 1;
        }
        if update.completed_at.is_some() {
            clauses.push(format!("completed_at = COALESCE(completed_at, ${bind_idx})"));
            bind_idx += 1;
        }

        if clauses.is_empty() {
            // Nothing to set; treat as a guarded read.
            let row = self.fetch_row(id).await?.ok_or(StoreError::NotFound(id))?;
            let job = row.into_job()?;
            if job.status != expected {
                return Err(StoreError::StaleTransition(StaleTransition {
                    job_id: id,
                    expected,
                    observed: job.status,
                }));
            }
            return Ok(job);
        }

        let correlation_guard = if update.provider_correlation_id.is_some() {
            // Set-exactly-once: only write over NULL or the same value.
            format!(
                " AND (provider_correlation_id IS NULL OR provider_correlation_id = ${bind_idx})"
            )
        } else {
            String::new()
        };

        let query = format!(
            "UPDATE jobs SET {} \
             WHERE id = $1 AND status_id = $2{correlation_guard} \
             RETURNING {COLUMNS}",
            clauses.join(", "),
        );

        let mut q = sqlx::query_as::<_, JobRow>(&query).bind(id).bind(expected.id());
        if let Some(status) = update.status {
            q = q.bind(status.id());
        }
        if let Some(ref cid) = update.provider_correlation_id {
            q = q.bind(cid);
        }
        if let Some(ref url) = update.output_url {
            q = q.bind(url);
        }
        if let Some(ref url) = update.thumbnail_url {
            q = q.bind(url);
        }
        if let Some(ref msg) = update.error_message {
            q = q.bind(msg);
        }
        if let Some(at) = update.processing_started_at {
            q = q.bind(at);
        }
        if let Some(at) = update.completed_at {
            q = q.bind(at);
        }
        if let Some(ref cid) = update.provider_correlation_id {
            // The trailing guard parameter.
            q = q.bind(cid);
        }

        match q.fetch_optional(&self.pool).await? {
            Some(row) => row.into_job(),
            None => {
                // The guard lost. Reload to tell the caller what happened.
                let row = self.fetch_row(id).await?.ok_or(StoreError::NotFound(id))?;
                let job = row.into_job()?;
                if job.status == expected {
                    // Status matched, so the correlation-id guard rejected.
                    Err(StoreError::Backend(format!(
                        "provider_correlation_id already set on job {id}"
                    )))
                } else {
                    Err(StoreError::StaleTransition(StaleTransition {
                        job_id: id,
                        expected,
                        observed: job.status,
                    }))
                }
            }
        }
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_owner(
        &self,
        owner_id: OwnerId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE owner_id = $1 \
             ORDER BY created_at DESC \
             LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(owner_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn list_unfinished(&self) -> Result<Vec<JobId>, StoreError> {
        let terminal: Vec<i16> = [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled]
            .iter()
            .map(|s| s.id())
            .collect();
        Ok(sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM jobs \
             WHERE status_id <> ALL($1) \
             ORDER BY created_at ASC",
        )
        .bind(&terminal)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn checkpoints(&self, job_id: JobId) -> Result<Vec<StepCheckpoint>, StoreError> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            "SELECT result, recorded_at FROM job_checkpoints \
             WHERE job_id = $1 \
             ORDER BY step_index ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }

    async fn append_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: &StepCheckpoint,
    ) -> Result<(), StoreError> {
        let result = serde_json::to_value(&checkpoint.result)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let step_index = checkpoint.step.index() as i16;

        // Counted insert: succeeds only if exactly `step_index` earlier
        // checkpoints exist, which is the write-ahead discipline.
        let inserted = sqlx::query(
            "INSERT INTO job_checkpoints (job_id, step_index, step_name, result, recorded_at) \
             SELECT $1, $2, $3, $4, $5 \
             WHERE (SELECT COUNT(*) FROM job_checkpoints WHERE job_id = $1) = $2",
        )
        .bind(job_id)
        .bind(step_index)
        .bind(checkpoint.step.as_str())
        .bind(result)
        .bind(checkpoint.recorded_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::CheckpointOrder(format!(
                "checkpoint '{}' for job {job_id} is out of order",
                checkpoint.step.as_str()
            )));
        }
        Ok(())
    }
}
