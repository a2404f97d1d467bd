//! Concurrent submission with internal batching.
//!
//! ```text
//! generate() ──▶ mpsc queue ──▶ worker: collect ≤ max_batch within window
//!     ▲                                  │
//!     └──────────── oneshot reply ◀──── model.generate(batch)
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Result, RuntimeError};
use crate::model::{GenerationInput, VisionLanguageModel};

struct Job {
    input: GenerationInput,
    reply: oneshot::Sender<Result<String>>,
}

/// Batching parameters.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub batch_window: Duration,
    pub queue_capacity: usize,
}

#[derive(Debug, Default)]
struct Stats {
    batches: AtomicUsize,
    largest: AtomicUsize,
}

pub struct FastBatchBackend {
    queue: mpsc::Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<Stats>,
}

impl FastBatchBackend {
    /// Start the batching worker. Must be called inside a tokio runtime.
    pub fn start(model: Arc<dyn VisionLanguageModel>, config: BatchConfig) -> Self {
        let (queue, jobs) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(Stats::default());
        let worker = tokio::spawn(run_worker(model, jobs, config, Arc::clone(&stats)));
        Self {
            queue,
            worker: Mutex::new(Some(worker)),
            stats,
        }
    }

    /// Submit a request and wait for its result.
    ///
    /// Dropping the returned future withdraws the request if it has not
    /// reached the model yet.
    pub async fn generate(&self, input: GenerationInput) -> Result<String> {
        let (reply, result) = oneshot::channel();
        self.queue
            .send(Job { input, reply })
            .await
            .map_err(|_| RuntimeError::ShutDown)?;
        result.await.map_err(|_| RuntimeError::ShutDown)?
    }

    /// Number of batches handed to the model so far.
    pub fn batches_run(&self) -> usize {
        self.stats.batches.load(Ordering::Relaxed)
    }

    pub fn largest_batch(&self) -> usize {
        self.stats.largest.load(Ordering::Relaxed)
    }

    /// Stop the worker. Queued requests fail with `ShutDown`.
    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

impl Drop for FastBatchBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(
    model: Arc<dyn VisionLanguageModel>,
    mut jobs: mpsc::Receiver<Job>,
    config: BatchConfig,
    stats: Arc<Stats>,
) {
    let max_batch = config.max_batch_size.max(1);

    while let Some(first) = jobs.recv().await {
        let mut batch = vec![first];
        let window_end = Instant::now() + config.batch_window;
        while batch.len() < max_batch {
            match tokio::time::timeout_at(window_end, jobs.recv()).await {
                Ok(Some(job)) => batch.push(job),
                Ok(None) | Err(_) => break,
            }
        }

        // Callers that gave up while queued are not worth a model slot
        batch.retain(|job| !job.reply.is_closed());
        if batch.is_empty() {
            continue;
        }

        let size = batch.len();
        let (inputs, replies): (Vec<_>, Vec<_>) =
            batch.into_iter().map(|job| (job.input, job.reply)).unzip();
        stats.batches.fetch_add(1, Ordering::Relaxed);
        stats.largest.fetch_max(size, Ordering::Relaxed);
        tracing::debug!(size, "running generation batch");

        let model = Arc::clone(&model);
        let results = tokio::task::spawn_blocking(move || model.generate(inputs)).await;

        match results {
            Ok(results) if results.len() == size => {
                for (reply, result) in replies.into_iter().zip(results) {
                    let _ = reply.send(result);
                }
            }
            Ok(results) => {
                tracing::error!(expected = size, got = results.len(), "model returned a short batch");
                for reply in replies {
                    let _ = reply.send(Err(RuntimeError::Generation(format!(
                        "model returned {} results for a batch of {}",
                        results.len(),
                        size
                    ))));
                }
            }
            Err(e) => {
                tracing::error!("generation batch panicked: {}", e);
                for reply in replies {
                    let _ = reply.send(Err(RuntimeError::Generation(format!(
                        "generation task failed: {}",
                        e
                    ))));
                }
            }
        }
    }

    tracing::debug!("generation queue closed, batch worker exiting");
}
