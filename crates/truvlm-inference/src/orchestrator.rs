//! Request orchestrator: validate → resolve → sample → plan → assemble → generate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use truvlm::tracing::prefix;
use truvlm::{
    Error, GenerationParams, InferenceResult, Result, Settings, Stage, VideoConstraints,
    VideoRequest,
};
use truvlm_vidprep::{CancelFlag, Preprocessor};

use crate::model::{GenerationInput, ModelLoader};
use crate::session::ModelSession;

/// Hook handed over by the upload/fetch collaborator, called once the
/// request no longer needs its local file.
pub type ReleaseHook = Box<dyn FnOnce() + Send + 'static>;

/// Runs the release hook when dropped, so every exit path releases.
struct ReleaseGuard(Option<ReleaseHook>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// Cancels the request flag when the request future is dropped or finishes,
/// stopping any decode work still running on the blocking pool.
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Request parameters after defaults are applied and ranges checked.
struct Validated {
    video: VideoConstraints,
    generation: GenerationParams,
}

pub struct Orchestrator {
    settings: Settings,
    session: Arc<ModelSession>,
    preprocessor: Arc<Preprocessor>,
    /// Ceiling on requests decoding at the same time
    preprocess_slots: Arc<Semaphore>,
    /// Host memory for frame batches, one permit per MiB
    memory: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl Orchestrator {
    pub fn new(settings: Settings, session: Arc<ModelSession>, preprocessor: Preprocessor) -> Self {
        let preprocess_slots = Arc::new(Semaphore::new(settings.preprocess.max_concurrent));
        let memory = Arc::new(Semaphore::new(memory_permits(&settings)));
        Self {
            settings,
            session,
            preprocessor: Arc::new(preprocessor),
            preprocess_slots,
            memory,
            next_id: AtomicU64::new(1),
        }
    }

    /// Wire the default decode backends and a session around `loader`.
    pub fn from_settings(settings: Settings, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        settings.validate()?;
        let preprocessor = Preprocessor::from_settings(&settings)?;
        let session = ModelSession::from_settings(&settings, loader);
        Ok(Self::new(settings, session, preprocessor))
    }

    pub fn session(&self) -> &Arc<ModelSession> {
        &self.session
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Serve one request.
    ///
    /// `release` is invoked exactly once before this returns (or when the
    /// returned future is dropped), whatever the outcome.
    pub async fn infer(
        &self,
        request: VideoRequest,
        release: Option<ReleaseHook>,
    ) -> Result<InferenceResult> {
        let _release = ReleaseGuard(release);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("infer", request_id = id, source = %request.source);

        async {
            let started = std::time::Instant::now();
            let deadline = Instant::now() + self.settings.runtime.request_timeout();
            let result = self.run(&request, deadline).await;
            match &result {
                Ok(_) => info!(
                    "{} Request served in {:.2}s",
                    prefix::CLOSE,
                    started.elapsed().as_secs_f64()
                ),
                Err(e) => warn!(
                    stage = %e.stage(),
                    kind = ?e.kind(),
                    "{} Request failed after {:.2}s: {}",
                    prefix::CLOSE,
                    started.elapsed().as_secs_f64(),
                    e
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, request: &VideoRequest, deadline: Instant) -> Result<InferenceResult> {
        let params = self.validate(request)?;

        self.session.ensure_ready().await?;

        let cancel = CancelFlag::new();
        let _cancel = CancelOnDrop(cancel.clone());

        let frames = {
            let _slot = self
                .preprocess_slots
                .acquire()
                .await
                .map_err(|_| Error::Cancelled {
                    stage: Stage::Resolve,
                })?;

            let video = self
                .preprocessor
                .open(&request.source, &cancel, Some(deadline))
                .await?;
            let (selection, plan) = self.preprocessor.plan(&video.metadata, &params.video)?;
            debug!(
                frames = plan.frames,
                width = plan.width,
                height = plan.height,
                backend = video.backend,
                "planned frame batch"
            );

            let _memory = self
                .memory
                .clone()
                .acquire_many_owned(self.memory_cost(plan.batch_bytes()))
                .await
                .map_err(|_| Error::Cancelled {
                    stage: Stage::Assemble,
                })?;
            cancel.check(Stage::Assemble)?;
            self.preprocessor
                .assemble(video, selection, plan, &cancel, Some(deadline))
                .await?
        };

        debug!(
            "{} Generating with {} patches, max {} tokens",
            prefix::MODEL,
            frames.num_patches(),
            params.generation.max_tokens
        );
        let text = self
            .session
            .generate(
                GenerationInput {
                    prompt: request.prompt.clone(),
                    frames,
                    params: params.generation,
                },
                Some(deadline),
            )
            .await?;

        Ok(InferenceResult {
            text,
            backend: self.session.kind().as_str().to_string(),
            source_echo: request.source.to_string(),
        })
    }

    /// Every check that can fail without touching the video.
    fn validate(&self, request: &VideoRequest) -> Result<Validated> {
        if request.prompt.trim().is_empty() {
            return Err(Error::validation("prompt", "must not be empty"));
        }

        let generation = request
            .generation_params
            .clone()
            .unwrap_or_default()
            .resolve(&self.settings.generation)?;
        let video = request
            .video_params
            .clone()
            .unwrap_or_default()
            .resolve(&self.settings.video.defaults, self.settings.video.min_frames)?;

        if let Some(path) = request.source.local_path() {
            if !path.exists() {
                return Err(Error::validation(
                    "source",
                    format!("{} does not exist", path.display()),
                ));
            }
        }

        Ok(Validated { video, generation })
    }

    /// Memory permits for a batch: its size in MiB, clamped to the budget so
    /// an oversized batch still runs, alone.
    fn memory_cost(&self, bytes: u64) -> u32 {
        let mib = bytes.div_ceil(1024 * 1024);
        mib.clamp(1, memory_permits(&self.settings) as u64) as u32
    }
}

fn memory_permits(settings: &Settings) -> usize {
    settings
        .preprocess
        .memory_budget_mb
        .min(u32::MAX as u64)
        .max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_release_guard_runs_once_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        {
            let _guard = ReleaseGuard(Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_memory_cost_is_clamped_to_budget() {
        let mut settings = Settings::default();
        settings.preprocess.memory_budget_mb = 64;
        let session = ModelSession::from_settings(
            &settings,
            crate::model::default_loader(&settings),
        );
        let preprocessor = Preprocessor::from_settings(&settings).unwrap();
        let orchestrator = Orchestrator::new(settings, session, preprocessor);

        assert_eq!(orchestrator.memory_cost(0), 1);
        assert_eq!(orchestrator.memory_cost(1), 1);
        assert_eq!(orchestrator.memory_cost(3 * 1024 * 1024 + 1), 4);
        assert_eq!(orchestrator.memory_cost(u64::MAX / 2), 64);
    }
}
