//! Durable step executor for generation jobs.
//!
//! `run` drives one job through the canonical step sequence. Every step
//! is checkpointed after it completes, so a crashed or redelivered run
//! resumes at the first unexecuted step and replays stored results
//! instead of redoing work. Resumption rules:
//!
//! - A checkpoint for step *N* means step *N* is never re-executed.
//! - `submit-to-provider` is checkpointed before the correlation id is
//!   written to the record, so the provider is called at most once per
//!   job. A crash between the provider accepting and the checkpoint
//!   write orphans that provider request; the resumed run submits again.
//!   This window is accepted -- the alternative (checkpoint first) would
//!   replay a correlation id the provider may never have issued.
//! - Status transitions go through guarded conditional updates. A
//!   `StaleTransition` whose observed status equals the target is a
//!   re-execution of an already-applied transition and counts as
//!   success.

use std::sync::Arc;

use chrono::Utc;

use mirage_core::job::Job;
use mirage_core::provider::{CorrelationId, JobSpec, ProviderError};
use mirage_core::retry::RetryPolicy;
use mirage_core::state_machine::JobStatus;
use mirage_core::steps::{AwaitOutcome, StepCheckpoint, StepName, StepResult};
use mirage_core::types::JobId;
use mirage_db::{JobStore, JobUpdate, StoreError};

use crate::registry::ProviderRegistry;
use crate::EngineError;

/// Executes the canonical step sequence for a single job.
pub struct StepExecutor {
    store: Arc<dyn JobStore>,
    providers: Arc<ProviderRegistry>,
    submit_retry: RetryPolicy,
    await_retry: RetryPolicy,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn JobStore>, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            store,
            providers,
            submit_retry: RetryPolicy::submit(),
            await_retry: RetryPolicy::await_completion(),
        }
    }

    /// Override the retry policies (tests use near-zero delays).
    pub fn with_policies(mut self, submit: RetryPolicy, await_completion: RetryPolicy) -> Self {
        self.submit_retry = submit;
        self.await_retry = await_completion;
        self
    }

    /// Run the workflow for `job_id` from wherever it left off.
    ///
    /// Completes normally when the job reaches a terminal status, when
    /// it is already terminal, or when the record has been deleted (the
    /// remaining steps are abandoned at the step boundary).
    pub async fn run(&self, job_id: JobId) -> Result<(), EngineError> {
        match self.run_steps(job_id).await {
            Err(EngineError::Store(StoreError::NotFound(_))) => {
                tracing::warn!(job_id = %job_id, "Job record deleted mid-workflow, abandoning");
                Ok(())
            }
            other => other,
        }
    }

    async fn run_steps(&self, job_id: JobId) -> Result<(), EngineError> {
        let Some(job) = self.store.get(job_id).await? else {
            tracing::warn!(job_id = %job_id, "Workflow event for unknown job, ignoring");
            return Ok(());
        };
        if job.status.is_terminal() {
            tracing::debug!(job_id = %job_id, status = job.status.name(), "Job already terminal");
            return Ok(());
        }

        let checkpoints = self.store.checkpoints(job_id).await?;

        // -- mark-processing --
        if checkpoints.len() <= StepName::MarkProcessing.index() {
            if !self.mark_processing(job_id).await? {
                return Ok(());
            }
            self.checkpoint(job_id, StepResult::MarkedProcessing).await?;
        }

        // -- submit-to-provider --
        let correlation_id = match checkpoints.get(StepName::SubmitToProvider.index()) {
            Some(cp) => replay_correlation_id(cp)?,
            None => {
                // Reload at the step boundary; a deleted record aborts here.
                let Some(job) = self.store.get(job_id).await? else {
                    tracing::warn!(job_id = %job_id, "Job deleted before submission, abandoning");
                    return Ok(());
                };
                match self.submit_with_retry(&job).await {
                    Ok(correlation_id) => {
                        self.checkpoint(
                            job_id,
                            StepResult::Submitted {
                                correlation_id: correlation_id.clone(),
                            },
                        )
                        .await?;
                        correlation_id
                    }
                    Err(message) => {
                        return self
                            .apply_outcome(job_id, &AwaitOutcome::PermanentFailure { message })
                            .await;
                    }
                }
            }
        };

        // The correlation id lands on the record after the checkpoint, so
        // a crash between the two leaves it unset. Re-applying the same
        // value is idempotent in the store.
        self.persist_correlation_id(job_id, &correlation_id).await?;

        // -- await-completion --
        let outcome = match checkpoints.get(StepName::AwaitCompletion.index()) {
            Some(cp) => replay_outcome(cp)?,
            None => {
                let Some(job) = self.store.get(job_id).await? else {
                    tracing::warn!(job_id = %job_id, "Job deleted while awaiting result, abandoning");
                    return Ok(());
                };
                let outcome = self.await_with_retry(&job, &correlation_id).await;
                self.checkpoint(job_id, StepResult::Finished(outcome.clone()))
                    .await?;
                outcome
            }
        };

        self.apply_outcome(job_id, &outcome).await
    }

    // -----------------------------------------------------------------------
    // Step bodies
    // -----------------------------------------------------------------------

    /// Transition `Pending -> Processing`. Returns `false` when the job
    /// is already terminal (e.g. failed by an earlier run) and the
    /// workflow should stop.
    async fn mark_processing(&self, job_id: JobId) -> Result<bool, EngineError> {
        let update = JobUpdate::transition(JobStatus::Processing)
            .with_processing_started_at(Utc::now());

        match self
            .store
            .update_if_status(job_id, JobStatus::Pending, update)
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::StaleTransition(stale)) => {
                if stale.observed == JobStatus::Processing {
                    // Already applied by a crashed run; carry on.
                    Ok(true)
                } else {
                    tracing::info!(
                        job_id = %job_id,
                        observed = stale.observed.name(),
                        "Job left pending state elsewhere, stopping workflow",
                    );
                    Ok(false)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn submit_with_retry(&self, job: &Job) -> Result<CorrelationId, String> {
        let spec = job_spec(job);
        let provider = self.providers.for_kind(job.kind);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match provider.submit(&spec).await {
                Ok(correlation_id) => {
                    tracing::info!(
                        job_id = %job.id,
                        correlation_id = %correlation_id,
                        attempt,
                        "Provider accepted submission",
                    );
                    return Ok(correlation_id);
                }
                Err(ProviderError::Permanent(message)) => {
                    return Err(format!("provider rejected submission: {message}"));
                }
                Err(ProviderError::Transient(message)) => {
                    if !self.submit_retry.allows_retry(attempt) {
                        return Err(format!(
                            "submission failed after {attempt} attempts: {message}"
                        ));
                    }
                    let delay = self.submit_retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        job_id = %job.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient submission failure, retrying",
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn await_with_retry(&self, job: &Job, correlation_id: &CorrelationId) -> AwaitOutcome {
        let provider = self.providers.for_kind(job.kind);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match provider.await_result(correlation_id).await {
                Ok(output) => {
                    return AwaitOutcome::Output {
                        output_url: output.output_url,
                        thumbnail_url: output.thumbnail_url,
                    };
                }
                Err(ProviderError::Permanent(message)) => {
                    return AwaitOutcome::PermanentFailure {
                        message: format!("generation failed: {message}"),
                    };
                }
                Err(ProviderError::Transient(message)) => {
                    if !self.await_retry.allows_retry(attempt) {
                        return AwaitOutcome::PermanentFailure {
                            message: format!(
                                "result retrieval failed after {attempt} attempts: {message}"
                            ),
                        };
                    }
                    let delay = self.await_retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        job_id = %job.id,
                        correlation_id = %correlation_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient failure awaiting result, retrying",
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Apply the workflow's terminal outcome to the record.
    async fn apply_outcome(&self, job_id: JobId, outcome: &AwaitOutcome) -> Result<(), EngineError> {
        let (target, update) = match outcome {
            AwaitOutcome::Output {
                output_url,
                thumbnail_url,
            } => (
                JobStatus::Completed,
                JobUpdate::transition(JobStatus::Completed)
                    .with_output(output_url.clone(), thumbnail_url.clone())
                    .with_completed_at(Utc::now()),
            ),
            AwaitOutcome::PermanentFailure { message } => (
                JobStatus::Failed,
                JobUpdate::transition(JobStatus::Failed)
                    .with_error(message.clone())
                    .with_completed_at(Utc::now()),
            ),
        };

        match self
            .store
            .update_if_status(job_id, JobStatus::Processing, update)
            .await
        {
            Ok(job) => {
                tracing::info!(job_id = %job_id, status = job.status.name(), "Job finished");
                Ok(())
            }
            Err(StoreError::StaleTransition(stale)) if stale.observed == target => {
                // A re-executed run already applied this outcome.
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Durable writes
    // -----------------------------------------------------------------------

    async fn checkpoint(&self, job_id: JobId, result: StepResult) -> Result<(), EngineError> {
        let checkpoint = StepCheckpoint::new(result);
        tracing::debug!(
            job_id = %job_id,
            step = checkpoint.step.as_str(),
            "Recording step checkpoint",
        );
        self.store.append_checkpoint(job_id, &checkpoint).await?;
        Ok(())
    }

    async fn persist_correlation_id(
        &self,
        job_id: JobId,
        correlation_id: &CorrelationId,
    ) -> Result<(), EngineError> {
        let update =
            JobUpdate::transition(JobStatus::Processing).with_correlation_id(correlation_id);

        match self
            .store
            .update_if_status(job_id, JobStatus::Processing, update)
            .await
        {
            Ok(_) => Ok(()),
            // A terminal record already carries the id from the run that
            // finished it; nothing left to persist.
            Err(StoreError::StaleTransition(stale)) if stale.observed.is_terminal() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint replay
// ---------------------------------------------------------------------------

fn replay_correlation_id(cp: &StepCheckpoint) -> Result<CorrelationId, EngineError> {
    match &cp.result {
        StepResult::Submitted { correlation_id } => Ok(correlation_id.clone()),
        other => Err(EngineError::CorruptCheckpoint(format!(
            "submit-to-provider checkpoint holds {other:?}"
        ))),
    }
}

fn replay_outcome(cp: &StepCheckpoint) -> Result<AwaitOutcome, EngineError> {
    match &cp.result {
        StepResult::Finished(outcome) => Ok(outcome.clone()),
        other => Err(EngineError::CorruptCheckpoint(format!(
            "await-completion checkpoint holds {other:?}"
        ))),
    }
}

fn job_spec(job: &Job) -> JobSpec {
    JobSpec {
        job_id: job.id,
        kind: job.kind,
        prompt: job.prompt.clone(),
        negative_prompt: job.negative_prompt.clone(),
        params: job.params.clone(),
    }
}
