//! Generation job routes.
//!
//! ```text
//! POST   /                 submit a generation job
//! GET    /                 list the caller's jobs, newest first
//! GET    /{id}             poll one job's status and result
//! DELETE /{id}             delete a job record
//! ```
//!
//! The caller is identified by the `x-owner-id` header (a UUID). Jobs
//! are strictly owner-scoped: another owner's job id behaves exactly
//! like a missing one.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use mirage_core::job::{GenerationKind, GenerationParams, Job, SubmitRequest};
use mirage_core::state_machine::JobStatus;
use mirage_core::types::{JobId, OwnerId, Timestamp};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Header carrying the caller's owner id.
pub const OWNER_HEADER: &str = "x-owner-id";

/// Default page size for listing.
const DEFAULT_LIMIT: i64 = 50;

/// Hard cap on the page size.
const MAX_LIMIT: i64 = 200;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_generations).post(submit_generation))
        .route("/{id}", get(get_generation).delete(delete_generation))
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One job as returned to clients. The provider correlation id stays
/// internal.
#[derive(Debug, Serialize)]
pub struct GenerationResponse {
    pub id: JobId,
    pub kind: GenerationKind,
    pub status: JobStatus,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub params: GenerationParams,
    pub output_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub processing_started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl From<Job> for GenerationResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            status: job.status,
            prompt: job.prompt,
            negative_prompt: job.negative_prompt,
            params: job.params,
            output_url: job.output_url,
            thumbnail_url: job.thumbnail_url,
            error_message: job.error_message,
            created_at: job.created_at,
            processing_started_at: job.processing_started_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST / -- validate and create a job, queue its workflow, return 201.
///
/// The `Json` extractor's rejection (malformed body, unknown `kind`) is
/// taken as a `Result` so it surfaces through [`AppError`] instead of
/// axum's plain-text default.
async fn submit_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<GenerationResponse>)> {
    let owner = owner_id(&headers)?;
    let Json(request) = body?;
    let job = state.dispatcher.submit(owner, request).await?;
    Ok((StatusCode::CREATED, Json(job.into())))
}

/// GET / -- the caller's jobs, newest first.
async fn list_generations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<GenerationResponse>>> {
    let owner = owner_id(&headers)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let jobs = state.store.list_by_owner(owner, limit, offset).await?;
    Ok(Json(jobs.into_iter().map(Into::into).collect()))
}

/// GET /{id} -- the polling endpoint: current status plus result or
/// error fields once terminal.
async fn get_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<JobId>,
) -> AppResult<Json<GenerationResponse>> {
    let owner = owner_id(&headers)?;
    let job = load_owned(&state, owner, id).await?;
    Ok(Json(job.into()))
}

/// DELETE /{id} -- remove the record. A job whose workflow is still
/// running keeps executing until its next step boundary, where it
/// notices the record is gone and abandons the rest.
async fn delete_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<JobId>,
) -> AppResult<StatusCode> {
    let owner = owner_id(&headers)?;
    load_owned(&state, owner, id).await?;

    state.store.delete(id).await?;
    tracing::info!(job_id = %id, owner_id = %owner, "Generation job deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extract and parse the `x-owner-id` header.
fn owner_id(headers: &HeaderMap) -> Result<OwnerId, AppError> {
    let value = headers
        .get(OWNER_HEADER)
        .ok_or_else(|| AppError::BadRequest(format!("missing {OWNER_HEADER} header")))?;
    let s = value
        .to_str()
        .map_err(|_| AppError::BadRequest(format!("invalid {OWNER_HEADER} header")))?;
    s.parse()
        .map_err(|_| AppError::BadRequest(format!("{OWNER_HEADER} must be a UUID")))
}

/// Load a job and verify ownership. A foreign or missing id is a 404
/// either way, so ids do not leak across owners.
async fn load_owned(state: &AppState, owner: OwnerId, id: JobId) -> Result<Job, AppError> {
    match state.store.get(id).await? {
        Some(job) if job.owner_id == owner => Ok(job),
        _ => Err(AppError::Store(mirage_db::StoreError::NotFound(id))),
    }
}
