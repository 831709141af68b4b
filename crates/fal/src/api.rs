//! REST client for the fal.ai queue API.
//!
//! The queue API is a three-endpoint protocol per model:
//! `POST /{model}` submits a request and returns a `request_id`,
//! `GET /{model}/requests/{id}/status` reports queue progress, and
//! `GET /{model}/requests/{id}` returns the terminal result payload.

use std::time::Duration;

use serde::Deserialize;

use mirage_core::provider::ProviderError;
use mirage_core::retry::{next_delay, RetryPolicy};

/// Default base URL of the fal.ai queue API.
pub const DEFAULT_BASE_URL: &str = "https://queue.fal.run";

/// Configuration for the fal.ai client.
#[derive(Debug, Clone)]
pub struct FalConfig {
    /// API key, sent as `Authorization: Key <key>`.
    pub api_key: String,
    /// Base URL (overridable for tests and proxies).
    pub base_url: String,
}

impl FalConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Load from the `FAL_KEY` (and optional `FAL_BASE_URL`) env vars.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("FAL_KEY").ok()?;
        let base_url =
            std::env::var("FAL_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Some(Self { api_key, base_url })
    }
}

/// Response returned by the queue submit endpoint.
#[derive(Debug, Deserialize)]
pub struct QueuedRequest {
    /// Server-assigned identifier for the queued request.
    pub request_id: String,
}

/// Queue status payload.
#[derive(Debug, Deserialize)]
pub struct RequestStatus {
    pub status: String,
}

/// Queue states reported by the status endpoint.
pub const STATUS_IN_QUEUE: &str = "IN_QUEUE";
pub const STATUS_IN_PROGRESS: &str = "IN_PROGRESS";
pub const STATUS_COMPLETED: &str = "COMPLETED";

/// Errors from the fal.ai REST layer.
#[derive(Debug, thiserror::Error)]
pub enum FalApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// fal.ai returned a non-2xx status code.
    #[error("fal.ai API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

/// Whether an HTTP status code indicates a retryable condition.
pub fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

impl FalApiError {
    /// Map a transport/API error onto the provider error taxonomy.
    ///
    /// Connection failures and timeouts never reached the server, so
    /// they are safe to retry even before a checkpoint exists. A body
    /// decode error means the server already responded -- ambiguous, so
    /// classified permanent rather than risking a duplicate submission.
    pub fn classify(&self) -> ProviderError {
        match self {
            FalApiError::Request(e) if e.is_connect() || e.is_timeout() => {
                ProviderError::Transient(e.to_string())
            }
            FalApiError::Request(e) => ProviderError::Permanent(e.to_string()),
            FalApiError::Api { status, body } if is_transient_status(*status) => {
                ProviderError::Transient(format!("fal.ai returned {status}: {body}"))
            }
            FalApiError::Api { status, body } => {
                ProviderError::Permanent(format!("fal.ai returned {status}: {body}"))
            }
        }
    }
}

/// HTTP client for the fal.ai queue API.
#[derive(Clone)]
pub struct FalQueueApi {
    client: reqwest::Client,
    config: FalConfig,
}

impl FalQueueApi {
    pub fn new(config: FalConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Reuse an existing [`reqwest::Client`] (connection pooling across
    /// adapters).
    pub fn with_client(client: reqwest::Client, config: FalConfig) -> Self {
        Self { client, config }
    }

    /// Submit a generation request to a model's queue.
    ///
    /// A single `POST /{model}` call. Callers own the decision of
    /// whether a failure is retryable -- see
    /// [`FalApiError::classify`].
    pub async fn submit(
        &self,
        model: &str,
        input: &serde_json::Value,
    ) -> Result<QueuedRequest, FalApiError> {
        let response = self
            .client
            .post(format!("{}/{model}", self.config.base_url))
            .header("Authorization", format!("Key {}", self.config.api_key))
            .json(input)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Fetch the queue status of a submitted request.
    pub async fn status(
        &self,
        model: &str,
        request_id: &str,
    ) -> Result<RequestStatus, FalApiError> {
        let response = self
            .client
            .get(format!(
                "{}/{model}/requests/{request_id}/status",
                self.config.base_url
            ))
            .header("Authorization", format!("Key {}", self.config.api_key))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Fetch the terminal result payload of a completed request.
    pub async fn result(
        &self,
        model: &str,
        request_id: &str,
    ) -> Result<serde_json::Value, FalApiError> {
        let response = self
            .client
            .get(format!(
                "{}/{model}/requests/{request_id}",
                self.config.base_url
            ))
            .header("Authorization", format!("Key {}", self.config.api_key))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Poll a request's status with bounded exponential backoff until it
    /// completes, then fetch and return the result payload.
    ///
    /// Sleeps between polls (yielding the task) so one slow generation
    /// never starves other jobs. Exhausting the poll budget is a
    /// [`ProviderError::Transient`] so the executor's retry policy
    /// decides whether to keep waiting.
    pub async fn poll_until_complete(
        &self,
        model: &str,
        request_id: &str,
        poll: &RetryPolicy,
    ) -> Result<serde_json::Value, ProviderError> {
        let mut delay = poll.initial_delay;

        for attempt in 1..=poll.max_attempts {
            let status = self
                .status(model, request_id)
                .await
                .map_err(|e| e.classify())?;

            match status.status.as_str() {
                STATUS_COMPLETED => {
                    return self.result(model, request_id).await.map_err(|e| e.classify());
                }
                STATUS_IN_QUEUE | STATUS_IN_PROGRESS => {
                    tracing::debug!(
                        model,
                        request_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        status = %status.status,
                        "Generation not finished yet",
                    );
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay, poll);
                }
                other => {
                    return Err(ProviderError::Permanent(format!(
                        "fal.ai reported unexpected status '{other}' for request {request_id}"
                    )));
                }
            }
        }

        Err(ProviderError::Transient(format!(
            "request {request_id} not complete after {} polls",
            poll.max_attempts
        )))
    }

    // ---- private helpers ----

    /// Parse a successful JSON response body into the expected type, or
    /// capture the status and body text on failure.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, FalApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(FalApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

/// Backoff used while polling for completion. Generation latency runs
/// seconds to minutes depending on modality, so the cap and attempt
/// budget are per-adapter.
pub fn poll_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(10),
        multiplier: 2.0,
        max_attempts,
    }
}
