//! Shared test fixtures: scripted provider, recording store, helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mirage_core::job::{GenerationKind, GenerationParams, Job, SubmitRequest};
use mirage_core::provider::{
    CorrelationId, GenerationOutput, GenerationProvider, JobSpec, ProviderError,
};
use mirage_core::retry::RetryPolicy;
use mirage_core::state_machine::JobStatus;
use mirage_core::steps::StepCheckpoint;
use mirage_core::types::{JobId, OwnerId, Timestamp};
use mirage_db::{JobStore, JobUpdate, MemoryStore, StoreError};
use mirage_engine::{ProviderRegistry, StepExecutor};

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

/// Provider double driven by scripted response queues. When a queue is
/// exhausted the provider succeeds with generated values, so tests only
/// script the interesting prefix.
pub struct MockProvider {
    submit_script: Mutex<VecDeque<Result<CorrelationId, ProviderError>>>,
    await_script: Mutex<VecDeque<Result<GenerationOutput, ProviderError>>>,
    submit_calls: AtomicU32,
    await_calls: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    await_delay: Duration,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            submit_script: Mutex::new(VecDeque::new()),
            await_script: Mutex::new(VecDeque::new()),
            submit_calls: AtomicU32::new(0),
            await_calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            await_delay: Duration::ZERO,
        }
    }

    pub fn submit_ok(self, correlation_id: &str) -> Self {
        self.push_submit(Ok(correlation_id.to_string()))
    }

    pub fn submit_transient(self, message: &str) -> Self {
        self.push_submit(Err(ProviderError::Transient(message.to_string())))
    }

    pub fn submit_permanent(self, message: &str) -> Self {
        self.push_submit(Err(ProviderError::Permanent(message.to_string())))
    }

    pub fn await_ok(self, output_url: &str, thumbnail_url: Option<&str>) -> Self {
        self.push_await(Ok(GenerationOutput {
            output_url: output_url.to_string(),
            thumbnail_url: thumbnail_url.map(str::to_string),
        }))
    }

    pub fn await_transient(self, message: &str) -> Self {
        self.push_await(Err(ProviderError::Transient(message.to_string())))
    }

    pub fn await_permanent(self, message: &str) -> Self {
        self.push_await(Err(ProviderError::Permanent(message.to_string())))
    }

    /// Delay inside `await_result`, to hold workflows in flight.
    pub fn with_await_delay(mut self, delay: Duration) -> Self {
        self.await_delay = delay;
        self
    }

    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn await_calls(&self) -> u32 {
        self.await_calls.load(Ordering::SeqCst)
    }

    /// Peak number of workflows between their submit and the end of
    /// their await.
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn push_submit(self, result: Result<CorrelationId, ProviderError>) -> Self {
        self.submit_script.lock().unwrap().push_back(result);
        self
    }

    fn push_await(self, result: Result<GenerationOutput, ProviderError>) -> Self {
        self.await_script.lock().unwrap().push_back(result);
        self
    }
}

#[async_trait]
impl GenerationProvider for MockProvider {
    async fn submit(&self, _spec: &JobSpec) -> Result<CorrelationId, ProviderError> {
        let call = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        self.submit_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("req-{call}")))
    }

    async fn await_result(
        &self,
        _correlation_id: &CorrelationId,
    ) -> Result<GenerationOutput, ProviderError> {
        self.await_calls.fetch_add(1, Ordering::SeqCst);
        if !self.await_delay.is_zero() {
            tokio::time::sleep(self.await_delay).await;
        }

        let result = self.await_script.lock().unwrap().pop_front();
        let result = result.unwrap_or_else(|| {
            Ok(GenerationOutput {
                output_url: "https://x/out.png".to_string(),
                thumbnail_url: None,
            })
        });
        if !matches!(result, Err(ProviderError::Transient(_))) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Recording store
// ---------------------------------------------------------------------------

/// [`JobStore`] wrapper that records the status after every successful
/// guarded update, to assert the observable transition sequence.
pub struct RecordingStore {
    inner: MemoryStore,
    statuses: Mutex<Vec<JobStatus>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            statuses: Mutex::new(Vec::new()),
        }
    }

    /// Recorded statuses with consecutive duplicates collapsed.
    pub fn status_sequence(&self) -> Vec<JobStatus> {
        let mut out: Vec<JobStatus> = Vec::new();
        for status in self.statuses.lock().unwrap().iter() {
            if out.last() != Some(status) {
                out.push(*status);
            }
        }
        out
    }
}

#[async_trait]
impl JobStore for RecordingStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.create(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.inner.get(id).await
    }

    async fn update_if_status(
        &self,
        id: JobId,
        expected: JobStatus,
        update: JobUpdate,
    ) -> Result<Job, StoreError> {
        let job = self.inner.update_if_status(id, expected, update).await?;
        self.statuses.lock().unwrap().push(job.status);
        Ok(job)
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn list_by_owner(
        &self,
        owner_id: OwnerId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.list_by_owner(owner_id, limit, offset).await
    }

    async fn list_unfinished(&self) -> Result<Vec<JobId>, StoreError> {
        self.inner.list_unfinished().await
    }

    async fn checkpoints(&self, job_id: JobId) -> Result<Vec<StepCheckpoint>, StoreError> {
        self.inner.checkpoints(job_id).await
    }

    async fn append_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: &StepCheckpoint,
    ) -> Result<(), StoreError> {
        self.inner.append_checkpoint(job_id, checkpoint).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Backoff with near-zero delays so retry paths run fast.
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        multiplier: 2.0,
        max_attempts,
    }
}

/// Executor over the given store and provider, with fast retry policies
/// (3 submit attempts, 5 await attempts, matching the defaults).
pub fn executor(store: Arc<dyn JobStore>, provider: Arc<MockProvider>) -> StepExecutor {
    let registry = Arc::new(ProviderRegistry::uniform(provider));
    StepExecutor::new(store, registry).with_policies(fast_policy(3), fast_policy(5))
}

pub fn text_request(prompt: &str) -> SubmitRequest {
    SubmitRequest {
        kind: GenerationKind::TextToImage,
        prompt: prompt.to_string(),
        negative_prompt: None,
        params: GenerationParams::default(),
    }
}

/// Create a `Pending` job record directly in the store.
pub async fn pending_job(store: &dyn JobStore, prompt: &str) -> Job {
    let job = Job::new(uuid::Uuid::new_v4(), text_request(prompt));
    store.create(&job).await.unwrap();
    job
}

/// Poll the store until the job reaches `status` (2s budget).
pub async fn wait_for_status(store: &dyn JobStore, id: JobId, status: JobStatus) -> Job {
    for _ in 0..200 {
        if let Some(job) = store.get(id).await.unwrap() {
            if job.status == status {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not reach {status:?} in time");
}

pub fn timestamp() -> Timestamp {
    chrono::Utc::now()
}
