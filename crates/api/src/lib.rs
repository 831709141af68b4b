//! HTTP surface for the generation service.
//!
//! Exposes job submission, the polling status endpoint, listing, and
//! deletion under `/api/v1/generations`, plus a root-level health
//! check. All orchestration lives in `mirage-engine`; handlers only
//! translate between HTTP and the dispatcher/store.

pub mod config;
pub mod error;
pub mod router;
pub mod routes;
pub mod state;
