//! Durable step vocabulary for the generation workflow.
//!
//! A job's workflow is an ordered, named sequence of steps. Each step's
//! completion is checkpointed independently so a restart resumes after
//! the last completed step instead of from the beginning. Presence of a
//! checkpoint for step *N* means step *N* must not be re-executed; its
//! stored result is replayed instead.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Step names
// ---------------------------------------------------------------------------

/// The named steps of a generation workflow, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepName {
    /// Transition the job to `Processing` and record the start time.
    MarkProcessing,
    /// Submit the request to the external provider and record the
    /// correlation id. The single point of duplicate-submission risk.
    SubmitToProvider,
    /// Wait for the provider's terminal result and record it.
    AwaitCompletion,
}

/// The canonical step sequence for a generation job.
pub const CANONICAL_STEPS: [StepName; 3] = [
    StepName::MarkProcessing,
    StepName::SubmitToProvider,
    StepName::AwaitCompletion,
];

impl StepName {
    /// Zero-based position of the step in the canonical sequence.
    pub fn index(self) -> usize {
        match self {
            Self::MarkProcessing => 0,
            Self::SubmitToProvider => 1,
            Self::AwaitCompletion => 2,
        }
    }

    /// Durable name of the step (kebab-case, stable across releases).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MarkProcessing => "mark-processing",
            Self::SubmitToProvider => "submit-to-provider",
            Self::AwaitCompletion => "await-completion",
        }
    }
}

// ---------------------------------------------------------------------------
// Step results and checkpoints
// ---------------------------------------------------------------------------

/// Terminal outcome recorded by the `await-completion` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AwaitOutcome {
    /// The provider produced a result.
    Output {
        output_url: String,
        thumbnail_url: Option<String>,
    },
    /// The provider rejected the request permanently (content policy,
    /// malformed input) or retries were exhausted.
    PermanentFailure { message: String },
}

/// Result payload of a completed step, replayed on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step_result", rename_all = "snake_case")]
pub enum StepResult {
    MarkedProcessing,
    Submitted { correlation_id: String },
    Finished(AwaitOutcome),
}

impl StepResult {
    /// The step this result belongs to. Used to enforce that a
    /// checkpoint's payload matches its step name.
    pub fn step(&self) -> StepName {
        match self {
            Self::MarkedProcessing => StepName::MarkProcessing,
            Self::Submitted { .. } => StepName::SubmitToProvider,
            Self::Finished(_) => StepName::AwaitCompletion,
        }
    }
}

/// Durable record that a step has completed, including any result needed
/// by later steps. Logically part of the job's durable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub step: StepName,
    pub result: StepResult,
    pub recorded_at: Timestamp,
}

impl StepCheckpoint {
    pub fn new(result: StepResult) -> Self {
        Self {
            step: result.step(),
            result,
            recorded_at: chrono::Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resumption
// ---------------------------------------------------------------------------

/// Given the checkpoints already written for a job (in append order),
/// return the first canonical step without a checkpoint, or `None` if
/// every step has completed.
///
/// Checkpoints are written in step order (write-ahead discipline), so
/// the first missing step is simply the one at index `checkpoints.len()`.
pub fn first_unexecuted_step(checkpoints: &[StepCheckpoint]) -> Option<StepName> {
    CANONICAL_STEPS.get(checkpoints.len()).copied()
}

/// Validate that appending a checkpoint for `step` preserves the
/// write-ahead discipline: a checkpoint for step *N+1* must never be
/// written without step *N*'s checkpoint already present.
pub fn validate_append(existing: &[StepCheckpoint], step: StepName) -> Result<(), String> {
    let expected = first_unexecuted_step(existing);
    if expected == Some(step) {
        Ok(())
    } else {
        Err(format!(
            "Checkpoint for step '{}' violates append order (expected {})",
            step.as_str(),
            expected.map_or("no further steps", |s| s.as_str()),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(result: StepResult) -> StepCheckpoint {
        StepCheckpoint::new(result)
    }

    #[test]
    fn canonical_order_matches_indices() {
        for (i, step) in CANONICAL_STEPS.iter().enumerate() {
            assert_eq!(step.index(), i);
        }
    }

    #[test]
    fn step_names_are_kebab_case() {
        assert_eq!(StepName::MarkProcessing.as_str(), "mark-processing");
        assert_eq!(StepName::SubmitToProvider.as_str(), "submit-to-provider");
        assert_eq!(StepName::AwaitCompletion.as_str(), "await-completion");
    }

    #[test]
    fn result_maps_to_owning_step() {
        assert_eq!(StepResult::MarkedProcessing.step(), StepName::MarkProcessing);
        assert_eq!(
            StepResult::Submitted {
                correlation_id: "abc123".into()
            }
            .step(),
            StepName::SubmitToProvider,
        );
    }

    // -- Resumption --

    #[test]
    fn fresh_job_starts_at_mark_processing() {
        assert_eq!(first_unexecuted_step(&[]), Some(StepName::MarkProcessing));
    }

    #[test]
    fn resume_after_submit_checkpoint_is_await() {
        let cps = vec![
            checkpoint(StepResult::MarkedProcessing),
            checkpoint(StepResult::Submitted {
                correlation_id: "abc123".into(),
            }),
        ];
        assert_eq!(first_unexecuted_step(&cps), Some(StepName::AwaitCompletion));
    }

    #[test]
    fn fully_checkpointed_job_has_no_next_step() {
        let cps = vec![
            checkpoint(StepResult::MarkedProcessing),
            checkpoint(StepResult::Submitted {
                correlation_id: "abc123".into(),
            }),
            checkpoint(StepResult::Finished(AwaitOutcome::Output {
                output_url: "https://x/out.png".into(),
                thumbnail_url: None,
            })),
        ];
        assert_eq!(first_unexecuted_step(&cps), None);
    }

    // -- Write-ahead discipline --

    #[test]
    fn append_in_order_accepted() {
        let cps = vec![checkpoint(StepResult::MarkedProcessing)];
        assert!(validate_append(&cps, StepName::SubmitToProvider).is_ok());
    }

    #[test]
    fn append_skipping_a_step_rejected() {
        let err = validate_append(&[], StepName::AwaitCompletion).unwrap_err();
        assert!(err.contains("append order"));
    }

    #[test]
    fn duplicate_append_rejected() {
        let cps = vec![checkpoint(StepResult::MarkedProcessing)];
        assert!(validate_append(&cps, StepName::MarkProcessing).is_err());
    }

    // -- Serialization --

    #[test]
    fn step_result_roundtrip() {
        let result = StepResult::Finished(AwaitOutcome::Output {
            output_url: "https://x/out.png".into(),
            thumbnail_url: Some("https://x/thumb.png".into()),
        });

        let json = serde_json::to_string(&result).unwrap();
        let back: StepResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn permanent_failure_roundtrip() {
        let result = StepResult::Finished(AwaitOutcome::PermanentFailure {
            message: "content policy violation".into(),
        });

        let json = serde_json::to_string(&result).unwrap();
        let back: StepResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
