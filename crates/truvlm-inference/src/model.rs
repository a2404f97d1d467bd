//! Model contract shared by both runtime backends.

use std::sync::Arc;

use truvlm::{GenerationParams, Settings};
use truvlm_vidprep::FrameBatch;

use crate::error::{Result, RuntimeError};

/// One generation request as handed to the model.
///
/// Owns its frame batch; the batch is dropped as soon as the model is done
/// with it.
#[derive(Debug)]
pub struct GenerationInput {
    pub prompt: String,
    pub frames: FrameBatch,
    pub params: GenerationParams,
}

/// A loaded vision-language model.
///
/// `generate` is blocking and called from the blocking pool. It receives a
/// batch of independent requests and returns one result per input, in
/// order.
pub trait VisionLanguageModel: Send + Sync {
    fn generate(&self, batch: Vec<GenerationInput>) -> Vec<Result<String>>;
}

/// Performs the expensive one-time model load.
pub trait ModelLoader: Send + Sync {
    /// Model location, for readiness reporting.
    fn model_path(&self) -> &str;

    fn load(&self) -> Result<Arc<dyn VisionLanguageModel>>;
}

/// Loader used when no model implementation is compiled in.
pub struct UnavailableLoader {
    model_path: String,
}

impl ModelLoader for UnavailableLoader {
    fn model_path(&self) -> &str {
        &self.model_path
    }

    fn load(&self) -> Result<Arc<dyn VisionLanguageModel>> {
        Err(RuntimeError::ModelLoad(format!(
            "cannot load {}: built without a model implementation (enable the onnx feature)",
            self.model_path
        )))
    }
}

/// Loader for the configured model.
pub fn default_loader(settings: &Settings) -> Arc<dyn ModelLoader> {
    #[cfg(feature = "onnx")]
    {
        Arc::new(crate::onnx::OnnxLoader::from_settings(settings))
    }
    #[cfg(not(feature = "onnx"))]
    {
        Arc::new(UnavailableLoader {
            model_path: settings.model.path.clone(),
        })
    }
}
