//! Provider adapter contract.
//!
//! A provider is an external generation capability (image or video)
//! reached over the network. The executor is modality-agnostic: both
//! concrete adapters honor the same two-call contract -- submit once,
//! then await the terminal result by correlation id.

use async_trait::async_trait;

use crate::job::{GenerationKind, GenerationParams};
use crate::types::JobId;

/// Provider-assigned identifier linking a submitted request to its
/// eventual result.
pub type CorrelationId = String;

/// The immutable slice of a job handed to the provider adapter.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_id: JobId,
    pub kind: GenerationKind,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub params: GenerationParams,
}

/// Terminal result of a generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    /// URL of the generated asset as reported by the provider.
    pub output_url: String,
    /// Optional provider-supplied thumbnail. Passed through verbatim;
    /// no thumbnailing happens on our side.
    pub thumbnail_url: Option<String>,
}

/// Errors surfaced by a provider adapter.
///
/// The transient/permanent split drives the retry policy: transient
/// failures are retried with backoff up to a bounded attempt count,
/// permanent failures fail the job immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Network timeout, connection failure, rate limit, or 5xx-class
    /// response. Safe to retry.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Content-policy rejection, malformed input, or any other failure
    /// the provider will repeat on resubmission. Never retried.
    #[error("Permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Uniform interface over external generation capabilities.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Submit a generation request. A single network call returning the
    /// provider's correlation id.
    ///
    /// Callers must not retry after a correlation id has been durably
    /// checkpointed; before that, retries are acceptable only for
    /// clearly transient transport failures, since the provider offers
    /// no idempotency key and may charge per call.
    async fn submit(&self, spec: &JobSpec) -> Result<CorrelationId, ProviderError>;

    /// Poll until the provider reports a terminal result for the given
    /// correlation id.
    ///
    /// Implementations must wait with bounded exponential-backoff
    /// polling, yielding between polls so other jobs make progress.
    /// Exhausting the poll budget is a [`ProviderError::Transient`].
    async fn await_result(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<GenerationOutput, ProviderError>;
}
