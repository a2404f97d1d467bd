//! Runtime execution strategies.

pub mod direct;
pub mod fast_batch;

use std::sync::Arc;

use truvlm::config::RuntimeSettings;
use truvlm::BackendKind;

pub use direct::DirectBackend;
pub use fast_batch::{BatchConfig, FastBatchBackend};

use crate::error::Result;
use crate::model::{GenerationInput, VisionLanguageModel};

/// The active runtime: one of two strategies over the same model contract.
pub enum ModelRuntime {
    FastBatch(FastBatchBackend),
    Direct(DirectBackend),
}

impl ModelRuntime {
    /// Wrap a loaded model in the strategy for `kind`.
    pub fn start(
        kind: BackendKind,
        model: Arc<dyn VisionLanguageModel>,
        settings: &RuntimeSettings,
    ) -> Self {
        match kind {
            BackendKind::FastBatch => ModelRuntime::FastBatch(FastBatchBackend::start(
                model,
                BatchConfig {
                    max_batch_size: settings.max_batch_size,
                    batch_window: settings.batch_window(),
                    queue_capacity: settings.queue_capacity,
                },
            )),
            BackendKind::Direct => ModelRuntime::Direct(DirectBackend::new(model)),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            ModelRuntime::FastBatch(_) => BackendKind::FastBatch,
            ModelRuntime::Direct(_) => BackendKind::Direct,
        }
    }

    pub async fn generate(&self, input: GenerationInput) -> Result<String> {
        match self {
            ModelRuntime::FastBatch(backend) => backend.generate(input).await,
            ModelRuntime::Direct(backend) => backend.generate(input).await,
        }
    }

    pub fn shutdown(&self) {
        if let ModelRuntime::FastBatch(backend) = self {
            backend.shutdown();
        }
    }
}
