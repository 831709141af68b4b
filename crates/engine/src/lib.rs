//! Workflow engine: step executor, provider registry, and dispatcher.
//!
//! The engine drives each generation job through its durable step
//! sequence exactly once, tolerating process crashes and redelivered
//! workflow events. See [`executor::StepExecutor`] for the resumption
//! rules and [`dispatcher::Dispatcher`] for concurrency control.

pub mod dispatcher;
pub mod executor;
pub mod registry;

use mirage_core::error::CoreError;
use mirage_db::StoreError;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use executor::StepExecutor;
pub use registry::ProviderRegistry;

/// Errors surfaced by the workflow engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A domain-level error (validation, conflicts).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The job store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored checkpoint's payload does not match its step.
    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// The workflow event queue is closed (dispatcher shut down).
    #[error("Workflow queue is closed")]
    QueueClosed,
}
