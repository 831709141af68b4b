//! In-memory job store.
//!
//! Backs tests and local single-process runs. All mutations happen under
//! one `RwLock` write guard, which gives the same atomicity for the
//! conditional update that the SQL implementation gets from a guarded
//! `UPDATE`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use mirage_core::job::Job;
use mirage_core::state_machine::{JobStatus, StaleTransition};
use mirage_core::steps::{validate_append, StepCheckpoint};
use mirage_core::types::{JobId, OwnerId};

use crate::{validate_update_status, JobStore, JobUpdate, StoreError};

#[derive(Debug, Clone)]
struct Record {
    job: Job,
    checkpoints: Vec<StepCheckpoint>,
}

/// In-process [`JobStore`] over a `HashMap`.
#[derive(Default)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<JobId, Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&job.id) {
            return Err(StoreError::Backend(format!(
                "duplicate job id {}",
                job.id
            )));
        }
        records.insert(
            job.id,
            Record {
                job: job.clone(),
                checkpoints: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(&id).map(|r| r.job.clone()))
    }

    async fn update_if_status(
        &self,
        id: JobId,
        expected: JobStatus,
        update: JobUpdate,
    ) -> Result<Job, StoreError> {
        validate_update_status(expected, &update)?;

        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if record.job.status != expected {
            return Err(StoreError::StaleTransition(StaleTransition {
                job_id: id,
                expected,
                observed: record.job.status,
            }));
        }

        let job = &mut record.job;
        if let Some(status) = update.status {
            job.status = status;
        }
        if let Some(cid) = update.provider_correlation_id {
            // Set exactly once; an idempotent re-write of the same value is fine.
            match &job.provider_correlation_id {
                Some(existing) if *existing != cid => {
                    return Err(StoreError::Backend(format!(
                        "provider_correlation_id already set on job {id}"
                    )));
                }
                _ => job.provider_correlation_id = Some(cid),
            }
        }
        if let Some(url) = update.output_url {
            job.output_url = Some(url);
        }
        if let Some(url) = update.thumbnail_url {
            job.thumbnail_url = Some(url);
        }
        if let Some(msg) = update.error_message {
            job.error_message = Some(msg);
        }
        if let Some(at) = update.processing_started_at {
            job.processing_started_at.get_or_insert(at);
        }
        if let Some(at) = update.completed_at {
            job.completed_at.get_or_insert(at);
        }

        Ok(job.clone())
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        Ok(records.remove(&id).is_some())
    }

    async fn list_by_owner(
        &self,
        owner_id: OwnerId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let records = self.records.read().await;
        let mut jobs: Vec<Job> = records
            .values()
            .filter(|r| r.job.owner_id == owner_id)
            .map(|r| r.job.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_unfinished(&self) -> Result<Vec<JobId>, StoreError> {
        let records = self.records.read().await;
        let mut ids: Vec<(JobId, mirage_core::types::Timestamp)> = records
            .values()
            .filter(|r| !r.job.status.is_terminal())
            .map(|r| (r.job.id, r.job.created_at))
            .collect();
        ids.sort_by_key(|(_, created)| *created);
        Ok(ids.into_iter().map(|(id, _)| id).collect())
    }

    async fn checkpoints(&self, job_id: JobId) -> Result<Vec<StepCheckpoint>, StoreError> {
        let records = self.records.read().await;
        let record = records.get(&job_id).ok_or(StoreError::NotFound(job_id))?;
        Ok(record.checkpoints.clone())
    }

    async fn append_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: &StepCheckpoint,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;

        validate_append(&record.checkpoints, checkpoint.step)
            .map_err(StoreError::CheckpointOrder)?;

        record.checkpoints.push(checkpoint.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
