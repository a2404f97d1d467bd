//! Single-tenant execution: one generation in flight at a time.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Result, RuntimeError};
use crate::model::{GenerationInput, VisionLanguageModel};

pub struct DirectBackend {
    model: Arc<dyn VisionLanguageModel>,
    /// Held for the whole model call, including past a caller timeout
    device: Arc<Mutex<()>>,
}

impl DirectBackend {
    pub fn new(model: Arc<dyn VisionLanguageModel>) -> Self {
        Self {
            model,
            device: Arc::new(Mutex::new(())),
        }
    }

    /// Queue behind any running generation, then run this one alone.
    ///
    /// Waiters are served in arrival order. The device lock moves into
    /// the blocking call, so a caller that stops waiting does not let the
    /// next request onto the device early.
    pub async fn generate(&self, input: GenerationInput) -> Result<String> {
        let device = Arc::clone(&self.device).lock_owned().await;
        let model = Arc::clone(&self.model);

        tokio::task::spawn_blocking(move || {
            let _device = device;
            model
                .generate(vec![input])
                .into_iter()
                .next()
                .unwrap_or_else(|| Err(RuntimeError::Generation("model returned no output".into())))
        })
        .await
        .map_err(|e| RuntimeError::Generation(format!("generation task failed: {}", e)))?
    }
}
