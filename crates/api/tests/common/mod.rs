//! Shared test harness: in-memory app with a stubbed provider.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use mirage_core::provider::{
    CorrelationId, GenerationOutput, GenerationProvider, JobSpec, ProviderError,
};
use mirage_db::MemoryStore;
use mirage_engine::{Dispatcher, DispatcherConfig, ProviderRegistry, StepExecutor};

use mirage_api::config::ServerConfig;
use mirage_api::router::build_app_router;
use mirage_api::state::AppState;

/// Provider stub: every submission is accepted and every await yields
/// the same output URL. Keeps API tests focused on the HTTP contract;
/// provider behavior is covered by the engine tests.
pub struct StubProvider;

#[async_trait]
impl GenerationProvider for StubProvider {
    async fn submit(&self, spec: &JobSpec) -> Result<CorrelationId, ProviderError> {
        Ok(format!("req-{}", spec.job_id))
    }

    async fn await_result(
        &self,
        _correlation_id: &CorrelationId,
    ) -> Result<GenerationOutput, ProviderError> {
        Ok(GenerationOutput {
            output_url: "https://x/out.png".to_string(),
            thumbnail_url: Some("https://x/thumb.png".to_string()),
        })
    }
}

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        max_concurrent_jobs: 4,
        queue_capacity: 64,
    }
}

/// Build the full application router over an in-memory store and the
/// stub provider, with the same middleware stack production uses.
pub fn build_test_app(store: Arc<MemoryStore>) -> Router {
    let config = test_config();

    let registry = Arc::new(ProviderRegistry::uniform(Arc::new(StubProvider)));
    let executor = Arc::new(StepExecutor::new(store.clone(), registry));
    let dispatcher = Dispatcher::start(
        store.clone(),
        executor,
        DispatcherConfig {
            max_concurrent_jobs: config.max_concurrent_jobs,
            queue_capacity: config.queue_capacity,
        },
        CancellationToken::new(),
    );

    let state = AppState {
        store,
        dispatcher,
        config: Arc::new(config.clone()),
    };
    build_app_router(state, &config)
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: &Router, path: &str, owner: Option<&str>) -> Response<Body> {
    send(app, Method::GET, path, owner, None).await
}

pub async fn post_json(
    app: &Router,
    path: &str,
    owner: Option<&str>,
    body: serde_json::Value,
) -> Response<Body> {
    send(app, Method::POST, path, owner, Some(body)).await
}

pub async fn delete(app: &Router, path: &str, owner: Option<&str>) -> Response<Body> {
    send(app, Method::DELETE, path, owner, None).await
}

async fn send(
    app: &Router,
    method: Method,
    path: &str,
    owner: Option<&str>,
    body: Option<serde_json::Value>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(owner) = owner {
        builder = builder.header("x-owner-id", owner);
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

/// Collect a response body into JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Poll `GET /api/v1/generations/{id}` until the job reports `status`
/// (2s budget). Returns the final response body.
pub async fn poll_until_status(
    app: &Router,
    owner: &str,
    id: &str,
    status: &str,
) -> serde_json::Value {
    let path = format!("/api/v1/generations/{id}");
    for _ in 0..200 {
        let response = get(app, &path, Some(owner)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        if json["status"] == status {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not reach status {status} in time");
}
