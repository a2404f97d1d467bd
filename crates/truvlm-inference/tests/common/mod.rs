//! Fake model and loader with call counters.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use truvlm::GenerationParams;
use truvlm_inference::{GenerationInput, ModelLoader, RuntimeError, VisionLanguageModel};
use truvlm_vidprep::FrameBatch;

/// Answers with the prompt and the frame batch shape.
#[derive(Default)]
pub struct EchoModel {
    pub delay: Duration,
    pub fail_with: Option<String>,
    pub batches: Mutex<Vec<usize>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl EchoModel {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn largest_batch(&self) -> usize {
        self.batches.lock().iter().copied().max().unwrap_or(0)
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().len()
    }
}

impl VisionLanguageModel for EchoModel {
    fn generate(&self, batch: Vec<GenerationInput>) -> Vec<Result<String, RuntimeError>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.batches.lock().push(batch.len());
        thread::sleep(self.delay);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        batch
            .into_iter()
            .map(|input| match &self.fail_with {
                Some(message) => Err(RuntimeError::Generation(message.clone())),
                None => Ok(format!(
                    "{} [{}x{}x{}]",
                    input.prompt, input.frames.frames, input.frames.height, input.frames.width
                )),
            })
            .collect()
    }
}

pub struct CountingLoader {
    pub model: Arc<EchoModel>,
    pub delay: Duration,
    pub fail: bool,
    pub loads: AtomicUsize,
}

impl CountingLoader {
    pub fn new(model: Arc<EchoModel>) -> Self {
        Self {
            model,
            delay: Duration::ZERO,
            fail: false,
            loads: AtomicUsize::new(0),
        }
    }

    pub fn slow(model: Arc<EchoModel>, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(model)
        }
    }

    pub fn broken() -> Self {
        Self {
            fail: true,
            ..Self::new(Arc::new(EchoModel::default()))
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for CountingLoader {
    fn model_path(&self) -> &str {
        "fake/echo"
    }

    fn load(&self) -> Result<Arc<dyn VisionLanguageModel>, RuntimeError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        if self.fail {
            return Err(RuntimeError::ModelLoad("weights not found".to_string()));
        }
        Ok(self.model.clone())
    }
}

/// A tiny valid batch: 2 frames of 32×32.
pub fn frame_batch() -> FrameBatch {
    FrameBatch {
        data: vec![0.0; 2 * 3 * 32 * 32],
        frames: 2,
        channels: 3,
        height: 32,
        width: 32,
        grid_thw: [1, 2, 2],
        sample_fps: 2.0,
    }
}

pub fn input(prompt: &str) -> GenerationInput {
    GenerationInput {
        prompt: prompt.to_string(),
        frames: frame_batch(),
        params: GenerationParams::default(),
    }
}
