//! Workflow dispatcher: intake queue, bounded concurrency, recovery.
//!
//! Accepts generation submissions, persists the job record before
//! anything else touches it, and feeds workflow events through a FIFO
//! queue into a pool of at most `max_concurrent_jobs` executor tasks.
//! An active-job set guarantees a single writer per job: a redelivered
//! event for a job whose workflow is still running is dropped, which is
//! what makes at-least-once event delivery safe.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use mirage_core::job::{validate_submit, GenerationKind, Job, SubmitRequest};
use mirage_core::types::{JobId, OwnerId};
use mirage_db::JobStore;

use crate::executor::StepExecutor;
use crate::EngineError;

/// Default number of concurrently executing workflows.
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

/// Default intake queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_024;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on workflows running at once.
    pub max_concurrent_jobs: usize,
    /// Intake queue depth; `submit` backpressures when full.
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// One queued request to run (or resume) a job's workflow.
#[derive(Debug, Clone)]
struct WorkflowEvent {
    job_id: JobId,
    owner_id: OwnerId,
    kind: GenerationKind,
}

/// Front door of the engine: creates job records and queues their
/// workflows. Obtain one with [`Dispatcher::start`].
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    tx: mpsc::Sender<WorkflowEvent>,
}

impl Dispatcher {
    /// Spawn the dispatch loop and return a handle for submitting work.
    ///
    /// The loop drains the queue until `cancel` fires; workflows already
    /// handed to an executor task run to their next durable point.
    pub fn start(
        store: Arc<dyn JobStore>,
        executor: Arc<StepExecutor>,
        config: DispatcherConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        tokio::spawn(dispatch_loop(rx, executor, config, cancel));
        Arc::new(Self { store, tx })
    }

    /// Validate a submission, create the `PENDING` record, and queue its
    /// workflow. The record exists before the event is queued, so a
    /// client can poll the job id returned here immediately.
    pub async fn submit(
        &self,
        owner_id: OwnerId,
        request: SubmitRequest,
    ) -> Result<Job, EngineError> {
        validate_submit(&request)?;

        let job = Job::new(owner_id, request);
        self.store.create(&job).await?;
        tracing::info!(
            job_id = %job.id,
            owner_id = %job.owner_id,
            kind = job.kind.as_str(),
            "Generation job created",
        );

        self.enqueue(WorkflowEvent {
            job_id: job.id,
            owner_id: job.owner_id,
            kind: job.kind,
        })
        .await?;
        Ok(job)
    }

    /// Queue a workflow event for an existing job (event redelivery,
    /// recovery). Unknown ids are rejected.
    pub async fn resume(&self, job_id: JobId) -> Result<(), EngineError> {
        let Some(job) = self.store.get(job_id).await? else {
            return Err(EngineError::Store(mirage_db::StoreError::NotFound(job_id)));
        };
        self.enqueue(WorkflowEvent {
            job_id: job.id,
            owner_id: job.owner_id,
            kind: job.kind,
        })
        .await
    }

    /// Startup recovery sweep: queue every job that has not reached a
    /// terminal status. Their executors resume from the last checkpoint.
    /// Returns the number of jobs queued.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let unfinished = self.store.list_unfinished().await?;
        let count = unfinished.len();
        if count > 0 {
            tracing::info!(count, "Recovering unfinished generation jobs");
        }
        for job_id in unfinished {
            self.resume(job_id).await?;
        }
        Ok(count)
    }

    async fn enqueue(&self, event: WorkflowEvent) -> Result<(), EngineError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| EngineError::QueueClosed)
    }
}

/// Drain the intake queue, starting one executor task per event in FIFO
/// order, gated by the concurrency semaphore and the active-job set.
async fn dispatch_loop(
    mut rx: mpsc::Receiver<WorkflowEvent>,
    executor: Arc<StepExecutor>,
    config: DispatcherConfig,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
    let active: Arc<Mutex<HashSet<JobId>>> = Arc::new(Mutex::new(HashSet::new()));

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        // Single writer per job: duplicates of an in-flight workflow are
        // dropped, the queue keeps its FIFO order for the rest.
        if !active.lock().await.insert(event.job_id) {
            tracing::debug!(
                job_id = %event.job_id,
                "Workflow already in flight, dropping duplicate event",
            );
            continue;
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                active.lock().await.remove(&event.job_id);
                break;
            }
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let executor = Arc::clone(&executor);
        let active = Arc::clone(&active);
        tokio::spawn(async move {
            tracing::debug!(
                job_id = %event.job_id,
                owner_id = %event.owner_id,
                kind = event.kind.as_str(),
                "Starting workflow",
            );
            if let Err(e) = executor.run(event.job_id).await {
                tracing::error!(job_id = %event.job_id, error = %e, "Workflow run failed");
            }
            active.lock().await.remove(&event.job_id);
            drop(permit);
        });
    }

    tracing::info!("Dispatch loop stopped");
}
