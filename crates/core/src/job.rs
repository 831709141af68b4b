//! Generation job entity, submission DTO, and validation.
//!
//! A [`Job`] is the unit of work: one user-requested generation task and
//! its durable state. All fields other than `status`, the provider
//! correlation id, the result references, and the transition timestamps
//! are immutable after creation.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::state_machine::JobStatus;
use crate::types::{JobId, OwnerId, Timestamp};

/// Maximum prompt length in characters.
pub const MAX_PROMPT_LEN: usize = 4_000;

// ---------------------------------------------------------------------------
// Generation kind
// ---------------------------------------------------------------------------

/// The generation modality requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationKind {
    TextToImage,
    TextToVideo,
    ImageToVideo,
    ImageToImage,
}

impl GenerationKind {
    /// All recognized kinds, in wire order.
    pub const ALL: [GenerationKind; 4] = [
        Self::TextToImage,
        Self::TextToVideo,
        Self::ImageToVideo,
        Self::ImageToImage,
    ];

    /// Wire name of the kind (SCREAMING_SNAKE_CASE).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextToImage => "TEXT_TO_IMAGE",
            Self::TextToVideo => "TEXT_TO_VIDEO",
            Self::ImageToVideo => "IMAGE_TO_VIDEO",
            Self::ImageToImage => "IMAGE_TO_IMAGE",
        }
    }

    /// Parse a wire name. Returns `None` for unrecognized kinds.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Whether the output of this kind is a video (affects which
    /// provider adapter handles it).
    pub fn is_video(self) -> bool {
        matches!(self, Self::TextToVideo | Self::ImageToVideo)
    }

    /// Whether this kind consumes a source image.
    pub fn needs_source_image(self) -> bool {
        matches!(self, Self::ImageToVideo | Self::ImageToImage)
    }
}

// ---------------------------------------------------------------------------
// Generation parameters
// ---------------------------------------------------------------------------

/// Named image size presets accepted by the image models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSize {
    SquareHd,
    Square,
    Portrait43,
    Portrait169,
    Landscape43,
    Landscape169,
}

impl ImageSize {
    /// Provider wire name for the preset.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SquareHd => "square_hd",
            Self::Square => "square",
            Self::Portrait43 => "portrait_4_3",
            Self::Portrait169 => "portrait_16_9",
            Self::Landscape43 => "landscape_4_3",
            Self::Landscape169 => "landscape_16_9",
        }
    }
}

/// Closed set of generation options captured at creation time and passed
/// verbatim to the provider adapter. Absent fields fall back to the
/// adapter's per-model defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Image output size preset (image kinds only).
    pub image_size: Option<ImageSize>,
    /// Number of denoising steps.
    pub num_inference_steps: Option<u32>,
    /// Classifier-free guidance scale.
    pub guidance_scale: Option<f64>,
    /// Number of images to generate in one request.
    pub num_images: Option<u32>,
    /// Seed for reproducible outputs.
    pub seed: Option<u64>,
    /// Clip duration in seconds (video kinds only).
    pub duration_secs: Option<u32>,
    /// Output frame rate (video kinds only).
    pub fps: Option<u32>,
    /// Output aspect ratio, e.g. `"16:9"` (video kinds only).
    pub aspect_ratio: Option<String>,
    /// Source image URL (image-to-* kinds only).
    pub source_image_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Job entity
// ---------------------------------------------------------------------------

/// One user-requested generation task and its durable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub kind: GenerationKind,
    pub status: JobStatus,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub params: GenerationParams,
    /// Provider-assigned identifier linking the submitted request to its
    /// eventual result. Set exactly once, when the provider accepts.
    pub provider_correlation_id: Option<String>,
    pub output_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub processing_started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl Job {
    /// Build a fresh `Pending` job from a validated submission.
    pub fn new(owner_id: OwnerId, request: SubmitRequest) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            owner_id,
            kind: request.kind,
            status: JobStatus::Pending,
            prompt: request.prompt,
            negative_prompt: request.negative_prompt,
            params: request.params,
            provider_correlation_id: None,
            output_url: None,
            thumbnail_url: None,
            error_message: None,
            created_at: Utc::now(),
            processing_started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Submission DTO and validation
// ---------------------------------------------------------------------------

/// A validated request to create a new generation job.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub kind: GenerationKind,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub params: GenerationParams,
}

/// Validate a submission before a job record is created.
///
/// Rules:
/// - `prompt` must be non-empty after trimming.
/// - `prompt` must not exceed [`MAX_PROMPT_LEN`] characters.
/// - Image-to-* kinds require `params.source_image_url`.
pub fn validate_submit(request: &SubmitRequest) -> Result<(), CoreError> {
    if request.prompt.trim().is_empty() {
        return Err(CoreError::Validation(
            "prompt must not be empty".to_string(),
        ));
    }
    if request.prompt.chars().count() > MAX_PROMPT_LEN {
        return Err(CoreError::Validation(format!(
            "prompt must not exceed {MAX_PROMPT_LEN} characters"
        )));
    }
    if request.kind.needs_source_image() && request.params.source_image_url.is_none() {
        return Err(CoreError::Validation(format!(
            "{} requires params.source_image_url",
            request.kind.as_str()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
