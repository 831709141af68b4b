//! Domain types and pure logic for the generation-job orchestration core.
//!
//! This crate has zero internal dependencies and no I/O. It defines the
//! job data model, the status state machine, the durable step/checkpoint
//! vocabulary, the provider adapter contract, and the shared retry policy.

pub mod error;
pub mod job;
pub mod provider;
pub mod retry;
pub mod state_machine;
pub mod steps;
pub mod types;
