//! Image generation adapter (`fal-ai/flux-pro`).

use async_trait::async_trait;
use serde_json::json;

use mirage_core::job::{GenerationKind, ImageSize};
use mirage_core::provider::{
    CorrelationId, GenerationOutput, GenerationProvider, JobSpec, ProviderError,
};
use mirage_core::retry::RetryPolicy;

use crate::api::{poll_policy, FalConfig, FalQueueApi};

/// Model path for image generation.
pub const IMAGE_MODEL: &str = "fal-ai/flux-pro";

/// Completion poll budget. Image latency is tens of seconds; with the
/// 10s delay cap this allows several minutes of waiting per attempt.
const IMAGE_POLL_ATTEMPTS: u32 = 30;

/// Default number of denoising steps.
const DEFAULT_INFERENCE_STEPS: u32 = 28;

/// Default guidance scale.
const DEFAULT_GUIDANCE_SCALE: f64 = 3.5;

/// [`GenerationProvider`] for the image modality
/// (TEXT_TO_IMAGE, IMAGE_TO_IMAGE).
pub struct FalImageProvider {
    api: FalQueueApi,
    poll: RetryPolicy,
}

impl FalImageProvider {
    pub fn new(config: FalConfig) -> Self {
        Self {
            api: FalQueueApi::new(config),
            poll: poll_policy(IMAGE_POLL_ATTEMPTS),
        }
    }

    pub fn with_api(api: FalQueueApi) -> Self {
        Self {
            api,
            poll: poll_policy(IMAGE_POLL_ATTEMPTS),
        }
    }
}

/// Build the model input payload from a job spec, applying the model's
/// defaults for absent parameters. The safety checker is always on.
pub fn build_image_payload(spec: &JobSpec) -> serde_json::Value {
    let params = &spec.params;
    let mut payload = json!({
        "prompt": spec.prompt,
        "image_size": params.image_size.unwrap_or(ImageSize::SquareHd).as_str(),
        "num_inference_steps": params.num_inference_steps.unwrap_or(DEFAULT_INFERENCE_STEPS),
        "guidance_scale": params.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE),
        "num_images": params.num_images.unwrap_or(1),
        "enable_safety_checker": true,
    });

    let object = payload.as_object_mut().unwrap();
    if let Some(ref negative) = spec.negative_prompt {
        object.insert("negative_prompt".into(), json!(negative));
    }
    if let Some(seed) = params.seed {
        object.insert("seed".into(), json!(seed));
    }
    if spec.kind == GenerationKind::ImageToImage {
        if let Some(ref url) = params.source_image_url {
            object.insert("image_url".into(), json!(url));
        }
    }

    payload
}

/// Extract the output reference from a flux result payload.
///
/// The model returns `{"images": [{"url": ..., ...}, ...]}`; the first
/// image is the job's output. A missing or empty `images` array is a
/// permanent failure -- resubmitting the same input would reproduce it.
pub fn parse_image_output(result: &serde_json::Value) -> Result<GenerationOutput, ProviderError> {
    let first = result
        .get("images")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| {
            ProviderError::Permanent(format!("malformed image result payload: {result}"))
        })?;

    let output_url = first
        .get("url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ProviderError::Permanent(format!("image result missing url: {result}"))
        })?
        .to_string();

    let thumbnail_url = first
        .get("thumbnail_url")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(GenerationOutput {
        output_url,
        thumbnail_url,
    })
}

#[async_trait]
impl GenerationProvider for FalImageProvider {
    async fn submit(&self, spec: &JobSpec) -> Result<CorrelationId, ProviderError> {
        let payload = build_image_payload(spec);
        let queued = self
            .api
            .submit(IMAGE_MODEL, &payload)
            .await
            .map_err(|e| e.classify())?;

        tracing::info!(
            job_id = %spec.job_id,
            request_id = %queued.request_id,
            model = IMAGE_MODEL,
            "Image generation queued",
        );
        Ok(queued.request_id)
    }

    async fn await_result(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<GenerationOutput, ProviderError> {
        let result = self
            .api
            .poll_until_complete(IMAGE_MODEL, correlation_id, &self.poll)
            .await?;
        parse_image_output(&result)
    }
}
