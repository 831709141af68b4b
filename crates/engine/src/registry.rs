//! Modality routing: generation kind -> provider adapter.

use std::sync::Arc;

use mirage_core::job::GenerationKind;
use mirage_core::provider::GenerationProvider;

/// Holds one adapter per modality. The executor stays
/// modality-agnostic; routing is the registry's only job.
pub struct ProviderRegistry {
    image: Arc<dyn GenerationProvider>,
    video: Arc<dyn GenerationProvider>,
}

impl ProviderRegistry {
    pub fn new(image: Arc<dyn GenerationProvider>, video: Arc<dyn GenerationProvider>) -> Self {
        Self { image, video }
    }

    /// A registry that routes every kind to the same adapter (tests).
    pub fn uniform(provider: Arc<dyn GenerationProvider>) -> Self {
        Self {
            image: Arc::clone(&provider),
            video: provider,
        }
    }

    /// The adapter responsible for the given kind.
    pub fn for_kind(&self, kind: GenerationKind) -> &Arc<dyn GenerationProvider> {
        if kind.is_video() {
            &self.video
        } else {
            &self.image
        }
    }
}
