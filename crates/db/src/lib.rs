//! Job record store: durable keyed storage for generation job state.
//!
//! The [`JobStore`] trait is the storage boundary consumed by the
//! dispatcher, the step executor, and the HTTP read path. Single-record
//! reads and conditional updates are all the engine needs -- there are no
//! cross-record transactions.
//!
//! Two implementations:
//! - [`MemoryStore`] -- in-process, used by tests and local runs.
//! - [`PgStore`] -- PostgreSQL via sqlx, used in production.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use mirage_core::job::Job;
use mirage_core::state_machine::{JobStatus, StaleTransition};
use mirage_core::steps::StepCheckpoint;
use mirage_core::types::{JobId, OwnerId, Timestamp};

pub use memory::MemoryStore;
pub use postgres::{create_pool, health_check, run_migrations, DbPool, PgStore};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by a job store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The conditional update's expected status did not match the record.
    /// Callers reload and reconcile; idempotent callers treat
    /// `observed == target` as success.
    #[error("{0}")]
    StaleTransition(StaleTransition),

    /// No record exists for the given job id.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// The requested status change is not a legal state-machine edge.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Appending a checkpoint would violate the write-ahead order.
    #[error("Checkpoint order violation: {0}")]
    CheckpointOrder(String),

    /// A stored payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The underlying storage backend failed.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => {
                StoreError::Backend("row not found".to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Conditional update payload
// ---------------------------------------------------------------------------

/// Fields to set in a single guarded update of a job record.
///
/// Data-driven rather than closure-based so the same mutation can be
/// expressed as a conditional SQL `UPDATE` or an in-memory write.
/// `None` fields are left untouched. `provider_correlation_id` is
/// set-exactly-once: re-setting it to a different value is rejected.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub provider_correlation_id: Option<String>,
    pub output_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub error_message: Option<String>,
    pub processing_started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl JobUpdate {
    /// An update that transitions the record to `status`.
    pub fn transition(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.provider_correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_output(
        mut self,
        output_url: impl Into<String>,
        thumbnail_url: Option<String>,
    ) -> Self {
        self.output_url = Some(output_url.into());
        self.thumbnail_url = thumbnail_url;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_processing_started_at(mut self, at: Timestamp) -> Self {
        self.processing_started_at = Some(at);
        self
    }

    pub fn with_completed_at(mut self, at: Timestamp) -> Self {
        self.completed_at = Some(at);
        self
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Durable keyed storage for generation jobs and their step checkpoints.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly created job record.
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    /// Fetch a job by id. `Ok(None)` if no record exists.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Atomically apply `update` to the record iff its current status
    /// equals `expected`. Returns the updated record.
    ///
    /// This conditional primitive is what makes state transitions safe
    /// against concurrent or re-executed writers: a mismatch yields
    /// [`StoreError::StaleTransition`] carrying the observed status.
    async fn update_if_status(
        &self,
        id: JobId,
        expected: JobStatus,
        update: JobUpdate,
    ) -> Result<Job, StoreError>;

    /// Delete a job record (and its checkpoints). Returns `true` if a
    /// record was deleted.
    async fn delete(&self, id: JobId) -> Result<bool, StoreError>;

    /// List an owner's jobs, newest first.
    async fn list_by_owner(
        &self,
        owner_id: OwnerId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, StoreError>;

    /// Jobs not yet in a terminal state, for the startup recovery sweep.
    async fn list_unfinished(&self) -> Result<Vec<JobId>, StoreError>;

    /// All checkpoints for a job, in step order.
    async fn checkpoints(&self, job_id: JobId) -> Result<Vec<StepCheckpoint>, StoreError>;

    /// Append a step checkpoint. Enforces the write-ahead discipline: a
    /// checkpoint for step *N+1* is rejected unless step *N*'s is
    /// already present.
    async fn append_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: &StepCheckpoint,
    ) -> Result<(), StoreError>;
}

/// Validate the status portion of a guarded update.
///
/// A `None` status or a same-status update (mutation without
/// transition, e.g. persisting the correlation id while `Processing`)
/// is always allowed; an actual transition must be a legal edge.
pub(crate) fn validate_update_status(
    expected: JobStatus,
    update: &JobUpdate,
) -> Result<(), StoreError> {
    match update.status {
        None => Ok(()),
        Some(to) if to == expected => Ok(()),
        Some(to) => mirage_core::state_machine::validate_transition(expected, to)
            .map_err(StoreError::InvalidTransition),
    }
}
