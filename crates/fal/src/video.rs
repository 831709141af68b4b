//! Video generation adapter (`fal-ai/minimax/video-01`).

use async_trait::async_trait;
use serde_json::json;

use mirage_core::job::GenerationKind;
use mirage_core::provider::{
    CorrelationId, GenerationOutput, GenerationProvider, JobSpec, ProviderError,
};
use mirage_core::retry::RetryPolicy;

use crate::api::{poll_policy, FalConfig, FalQueueApi};

/// Model path for video generation.
pub const VIDEO_MODEL: &str = "fal-ai/minimax/video-01";

/// Completion poll budget. Video renders take minutes, so the budget is
/// far larger than the image adapter's.
const VIDEO_POLL_ATTEMPTS: u32 = 120;

/// [`GenerationProvider`] for the video modality
/// (TEXT_TO_VIDEO, IMAGE_TO_VIDEO).
pub struct FalVideoProvider {
    api: FalQueueApi,
    poll: RetryPolicy,
}

impl FalVideoProvider {
    pub fn new(config: FalConfig) -> Self {
        Self {
            api: FalQueueApi::new(config),
            poll: poll_policy(VIDEO_POLL_ATTEMPTS),
        }
    }

    pub fn with_api(api: FalQueueApi) -> Self {
        Self {
            api,
            poll: poll_policy(VIDEO_POLL_ATTEMPTS),
        }
    }
}

/// Build the model input payload from a job spec. The video model takes
/// its own defaults for absent parameters, so only present fields are
/// forwarded.
pub fn build_video_payload(spec: &JobSpec) -> serde_json::Value {
    let params = &spec.params;
    let mut payload = json!({ "prompt": spec.prompt });

    let object = payload.as_object_mut().unwrap();
    if let Some(ref negative) = spec.negative_prompt {
        object.insert("negative_prompt".into(), json!(negative));
    }
    if let Some(duration) = params.duration_secs {
        object.insert("duration".into(), json!(duration));
    }
    if let Some(fps) = params.fps {
        object.insert("fps".into(), json!(fps));
    }
    if let Some(ref ratio) = params.aspect_ratio {
        object.insert("aspect_ratio".into(), json!(ratio));
    }
    if spec.kind == GenerationKind::ImageToVideo {
        if let Some(ref url) = params.source_image_url {
            object.insert("image_url".into(), json!(url));
        }
    }

    payload
}

/// Extract the output reference from a video result payload
/// (`{"video": {"url": ..., "thumbnail_url": ...}}`).
pub fn parse_video_output(result: &serde_json::Value) -> Result<GenerationOutput, ProviderError> {
    let video = result.get("video").ok_or_else(|| {
        ProviderError::Permanent(format!("malformed video result payload: {result}"))
    })?;

    let output_url = video
        .get("url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ProviderError::Permanent(format!("video result missing url: {result}"))
        })?
        .to_string();

    let thumbnail_url = video
        .get("thumbnail_url")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(GenerationOutput {
        output_url,
        thumbnail_url,
    })
}

#[async_trait]
impl GenerationProvider for FalVideoProvider {
    async fn submit(&self, spec: &JobSpec) -> Result<CorrelationId, ProviderError> {
        let payload = build_video_payload(spec);
        let queued = self
            .api
            .submit(VIDEO_MODEL, &payload)
            .await
            .map_err(|e| e.classify())?;

        tracing::info!(
            job_id = %spec.job_id,
            request_id = %queued.request_id,
            model = VIDEO_MODEL,
            "Video generation queued",
        );
        Ok(queued.request_id)
    }

    async fn await_result(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<GenerationOutput, ProviderError> {
        let result = self
            .api
            .poll_until_complete(VIDEO_MODEL, correlation_id, &self.poll)
            .await?;
        parse_video_output(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use mirage_core::job::GenerationParams;
    use serde_json::json;

    fn spec(kind: GenerationKind, params: GenerationParams) -> JobSpec {
        JobSpec {
            job_id: uuid::Uuid::now_v7(),
            kind,
            prompt: "waves crashing at dusk".into(),
            negative_prompt: None,
            params,
        }
    }

    #[test]
    fn minimal_payload_is_prompt_only() {
        let payload = build_video_payload(&spec(
            GenerationKind::TextToVideo,
            GenerationParams::default(),
        ));
        assert_eq!(payload, json!({"prompt": "waves crashing at dusk"}));
    }

    #[test]
    fn video_params_forwarded_when_present() {
        let params = GenerationParams {
            duration_secs: Some(6),
            fps: Some(24),
            aspect_ratio: Some("16:9".into()),
            ..Default::default()
        };
        let payload = build_video_payload(&spec(GenerationKind::TextToVideo, params));
        assert_eq!(payload["duration"], 6);
        assert_eq!(payload["fps"], 24);
        assert_eq!(payload["aspect_ratio"], "16:9");
    }

    #[test]
    fn image_to_video_includes_source_url() {
        let params = GenerationParams {
            source_image_url: Some("https://x/in.png".into()),
            ..Default::default()
        };
        let payload = build_video_payload(&spec(GenerationKind::ImageToVideo, params));
        assert_eq!(payload["image_url"], "https://x/in.png");
    }

    #[test]
    fn parse_video_url_and_thumbnail() {
        let result = json!({
            "video": {"url": "https://x/out.mp4", "thumbnail_url": "https://x/thumb.png"}
        });
        let output = parse_video_output(&result).unwrap();
        assert_eq!(output.output_url, "https://x/out.mp4");
        assert_eq!(output.thumbnail_url.as_deref(), Some("https://x/thumb.png"));
    }

    #[test]
    fn missing_video_is_permanent_failure() {
        let result = json!({"images": []});
        assert_matches!(
            parse_video_output(&result),
            Err(ProviderError::Permanent(_))
        );
    }
}
