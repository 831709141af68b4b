//! Job status state machine.
//!
//! Transitions are monotonic and one-directional: a job never leaves a
//! terminal state, and no transition skips `Processing`. The actual
//! atomicity of a transition is provided by the store's conditional
//! update (`update_if_status`); this module is the single source of
//! truth for which transitions are legal at all.

use serde::{Deserialize, Serialize};

use crate::types::JobId;

/// Status ID type as stored in the database (SMALLINT).
pub type StatusId = i16;

/// Lifecycle status of a generation job.
///
/// `Cancelling`/`Cancelled` are reserved in the transition table for a
/// future cancel path; no operation in this core produces them today.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending = 1,
    Processing = 2,
    Completed = 3,
    Failed = 4,
    Cancelling = 5,
    Cancelled = 6,
}

impl JobStatus {
    /// Return the database status ID.
    pub fn id(self) -> StatusId {
        self as StatusId
    }

    /// Map a database status ID back to the enum.
    pub fn from_id(id: StatusId) -> Option<Self> {
        match id {
            1 => Some(Self::Pending),
            2 => Some(Self::Processing),
            3 => Some(Self::Completed),
            4 => Some(Self::Failed),
            5 => Some(Self::Cancelling),
            6 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether this status is terminal (no outgoing transitions).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Human-readable name (for error messages and logs).
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelling => "Cancelling",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// Returns the set of valid target statuses reachable from `from`.
///
/// Terminal states return an empty slice because no further transitions
/// are allowed.
pub fn valid_transitions(from: JobStatus) -> &'static [JobStatus] {
    use JobStatus::*;
    match from {
        Pending => &[Processing, Cancelling],
        Processing => &[Completed, Failed, Cancelling],
        Cancelling => &[Cancelled],
        Completed | Failed | Cancelled => &[],
    }
}

/// Check whether a transition from `from` to `to` is valid.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    valid_transitions(from).contains(&to)
}

/// Validate a state transition, returning an error message for invalid ones.
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), String> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(format!(
            "Invalid transition: {} ({}) -> {} ({})",
            from.name(),
            from.id(),
            to.name(),
            to.id(),
        ))
    }
}

/// A guarded transition was rejected because the record's current status
/// did not match the expected one.
///
/// Not a user-visible failure: the caller reloads and reconciles. An
/// idempotent caller treats `observed == target` as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleTransition {
    pub job_id: JobId,
    /// Status the caller expected the record to be in.
    pub expected: JobStatus,
    /// Status actually observed on the record.
    pub observed: JobStatus,
}

impl std::fmt::Display for StaleTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Stale transition on job {}: expected {}, observed {}",
            self.job_id,
            self.expected.name(),
            self.observed.name(),
        )
    }
}
