//! fal.ai provider adapters.
//!
//! Wraps the fal.ai queue API (submit a request, poll its status, fetch
//! the result) behind the [`GenerationProvider`] contract from
//! `mirage-core`. One adapter per modality -- [`image::FalImageProvider`]
//! and [`video::FalVideoProvider`] -- sharing the HTTP client layer.
//!
//! [`GenerationProvider`]: mirage_core::provider::GenerationProvider

pub mod api;
pub mod image;
pub mod video;

pub use api::{FalApiError, FalConfig, FalQueueApi};
pub use image::FalImageProvider;
pub use video::FalVideoProvider;
