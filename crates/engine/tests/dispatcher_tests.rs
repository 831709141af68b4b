//! Dispatcher behavior: intake, validation, bounded concurrency,
//! duplicate suppression, recovery, and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tokio_util::sync::CancellationToken;

use mirage_core::error::CoreError;
use mirage_core::state_machine::JobStatus;
use mirage_core::steps::{StepCheckpoint, StepResult};
use mirage_db::{JobStore, JobUpdate, MemoryStore};
use mirage_engine::{Dispatcher, DispatcherConfig, EngineError};

use common::*;

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_creates_record_and_runs_workflow() {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(
        MockProvider::new()
            .submit_ok("abc123")
            .await_ok("https://x/out.png", None),
    );
    let exec = Arc::new(executor(store.clone(), provider));
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::start(
        store.clone(),
        exec,
        DispatcherConfig::default(),
        cancel.clone(),
    );

    let owner = uuid::Uuid::new_v4();
    let job = dispatcher
        .submit(owner, text_request("a red fox in snow"))
        .await
        .unwrap();

    // The record is pollable immediately, whatever state it is in.
    assert!(store.get(job.id).await.unwrap().is_some());

    let finished = wait_for_status(store.as_ref(), job.id, JobStatus::Completed).await;
    assert_eq!(finished.owner_id, owner);
    assert_eq!(finished.output_url.as_deref(), Some("https://x/out.png"));
    cancel.cancel();
}

#[tokio::test]
async fn invalid_submission_rejected_without_a_record() {
    let store = Arc::new(MemoryStore::new());
    let exec = Arc::new(executor(store.clone(), Arc::new(MockProvider::new())));
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::start(
        store.clone(),
        exec,
        DispatcherConfig::default(),
        cancel.clone(),
    );

    let owner = uuid::Uuid::new_v4();
    let err = dispatcher
        .submit(owner, text_request("   "))
        .await
        .unwrap_err();

    assert_matches!(err, EngineError::Core(CoreError::Validation(_)));
    assert!(store.list_by_owner(owner, 50, 0).await.unwrap().is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn resume_of_unknown_job_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let exec = Arc::new(executor(store.clone(), Arc::new(MockProvider::new())));
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::start(store, exec, DispatcherConfig::default(), cancel.clone());

    let err = dispatcher.resume(uuid::Uuid::now_v7()).await.unwrap_err();
    assert_matches!(
        err,
        EngineError::Store(mirage_db::StoreError::NotFound(_))
    );
    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Concurrency control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_workflows_stay_within_the_bound() {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(MockProvider::new().with_await_delay(Duration::from_millis(50)));
    let exec = Arc::new(executor(store.clone(), provider.clone()));
    let cancel = CancellationToken::new();
    let config = DispatcherConfig {
        max_concurrent_jobs: 2,
        ..Default::default()
    };
    let dispatcher = Dispatcher::start(store.clone(), exec, config, cancel.clone());

    let owner = uuid::Uuid::new_v4();
    let mut ids = Vec::new();
    for i in 0..5 {
        let job = dispatcher
            .submit(owner, text_request(&format!("prompt {i}")))
            .await
            .unwrap();
        ids.push(job.id);
    }

    for id in ids {
        wait_for_status(store.as_ref(), id, JobStatus::Completed).await;
    }
    assert!(provider.max_in_flight() <= 2);
    cancel.cancel();
}

#[tokio::test]
async fn duplicate_event_for_in_flight_job_is_dropped() {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(
        MockProvider::new()
            .submit_ok("abc123")
            .with_await_delay(Duration::from_millis(100)),
    );
    let exec = Arc::new(executor(store.clone(), provider.clone()));
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::start(
        store.clone(),
        exec,
        DispatcherConfig::default(),
        cancel.clone(),
    );

    let job = dispatcher
        .submit(uuid::Uuid::new_v4(), text_request("a red fox"))
        .await
        .unwrap();

    // Redeliver the workflow event while the first run holds the job.
    tokio::time::sleep(Duration::from_millis(20)).await;
    dispatcher.resume(job.id).await.unwrap();

    wait_for_status(store.as_ref(), job.id, JobStatus::Completed).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(provider.submit_calls(), 1);
    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recover_queues_every_unfinished_job() {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(MockProvider::new());
    let exec = Arc::new(executor(store.clone(), provider));
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::start(
        store.clone(),
        exec,
        DispatcherConfig::default(),
        cancel.clone(),
    );

    // Jobs persisted before a crash, never dispatched.
    let a = pending_job(store.as_ref(), "first").await;
    let b = pending_job(store.as_ref(), "second").await;

    let recovered = dispatcher.recover().await.unwrap();
    assert_eq!(recovered, 2);

    wait_for_status(store.as_ref(), a.id, JobStatus::Completed).await;
    wait_for_status(store.as_ref(), b.id, JobStatus::Completed).await;
    cancel.cancel();
}

#[tokio::test]
async fn recover_resumes_from_the_last_checkpoint() {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(MockProvider::new().await_ok("https://x/out.png", None));
    let exec = Arc::new(executor(store.clone(), provider.clone()));
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::start(
        store.clone(),
        exec,
        DispatcherConfig::default(),
        cancel.clone(),
    );

    // A job that crashed after its submission checkpoint.
    let job = pending_job(store.as_ref(), "a red fox").await;
    store
        .update_if_status(
            job.id,
            JobStatus::Pending,
            JobUpdate::transition(JobStatus::Processing).with_processing_started_at(timestamp()),
        )
        .await
        .unwrap();
    store
        .append_checkpoint(job.id, &StepCheckpoint::new(StepResult::MarkedProcessing))
        .await
        .unwrap();
    store
        .append_checkpoint(
            job.id,
            &StepCheckpoint::new(StepResult::Submitted {
                correlation_id: "abc123".into(),
            }),
        )
        .await
        .unwrap();

    assert_eq!(dispatcher.recover().await.unwrap(), 1);

    let finished = wait_for_status(store.as_ref(), job.id, JobStatus::Completed).await;
    assert_eq!(finished.provider_correlation_id.as_deref(), Some("abc123"));
    assert_eq!(provider.submit_calls(), 0);
    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_dispatcher_rejects_new_work() {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(MockProvider::new());
    let exec = Arc::new(executor(store.clone(), provider.clone()));
    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::start(
        store.clone(),
        exec,
        DispatcherConfig::default(),
        cancel.clone(),
    );

    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The record is created, but the queue is gone; the pending job is
    // left for the next startup's recovery sweep.
    let owner = uuid::Uuid::new_v4();
    let err = dispatcher
        .submit(owner, text_request("a red fox"))
        .await
        .unwrap_err();
    assert_matches!(err, EngineError::QueueClosed);

    let records = store.list_by_owner(owner, 50, 0).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, JobStatus::Pending);
    assert_eq!(provider.submit_calls(), 0);
}
