//! Process-wide model session.
//!
//! The lifecycle is a single-writer state machine published on a `watch`
//! channel:
//!
//! ```text
//! Unloaded ──▶ Loading ──▶ Ready
//!                 │
//!                 └──────▶ Failed   (terminal, no retry)
//! ```
//!
//! The first caller to see `Unloaded` claims the transition to `Loading`
//! and spawns the load; every other caller waits on the channel. The load
//! runs as its own task, so a caller that goes away mid-load cannot strand
//! the session in `Loading`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info};
use truvlm::config::RuntimeSettings;
use truvlm::tracing::prefix;
use truvlm::{BackendKind, Error, LifecycleState, Result, Settings};

use crate::backends::ModelRuntime;
use crate::error::RuntimeError;
use crate::model::{GenerationInput, ModelLoader};

/// Health summary for a readiness reporter.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    /// `healthy`, `degraded` (not loaded yet) or `failed`
    pub status: &'static str,
    pub state: LifecycleState,
    pub backend: BackendKind,
    pub model_path: String,
}

impl Readiness {
    /// True when the process can no longer serve and should be restarted.
    pub fn is_fatal(&self) -> bool {
        self.state.is_failed()
    }
}

pub struct ModelSession {
    kind: BackendKind,
    loader: Arc<dyn ModelLoader>,
    settings: RuntimeSettings,
    load_wait: Duration,
    state: watch::Sender<LifecycleState>,
    runtime: RwLock<Option<Arc<ModelRuntime>>>,
    loads: AtomicUsize,
    closed: AtomicBool,
}

impl ModelSession {
    pub fn new(
        kind: BackendKind,
        loader: Arc<dyn ModelLoader>,
        settings: RuntimeSettings,
        load_wait: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(LifecycleState::Unloaded);
        Arc::new(Self {
            kind,
            loader,
            settings,
            load_wait,
            state,
            runtime: RwLock::new(None),
            loads: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn from_settings(settings: &Settings, loader: Arc<dyn ModelLoader>) -> Arc<Self> {
        Self::new(
            settings.model.backend,
            loader,
            settings.runtime.clone(),
            Duration::from_secs(settings.model.load_wait_secs),
        )
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state.borrow().clone()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn readiness(&self) -> Readiness {
        let state = self.state();
        let status = match &state {
            LifecycleState::Ready => "healthy",
            LifecycleState::Failed { .. } => "failed",
            LifecycleState::Unloaded | LifecycleState::Loading => "degraded",
        };
        Readiness {
            status,
            state,
            backend: self.kind,
            model_path: self.loader.model_path().to_string(),
        }
    }

    /// Physical loads started so far. Never exceeds one.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn not_ready(&self, state: LifecycleState) -> Error {
        Error::ModelNotReady {
            backend: self.kind,
            state,
        }
    }

    /// Load the model if nobody has yet, then wait until the session settles.
    ///
    /// Idempotent: concurrent and repeated calls share the one load.
    pub async fn load(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.not_ready(LifecycleState::Unloaded));
        }

        let claimed = self.state.send_if_modified(|state| {
            if matches!(state, LifecycleState::Unloaded) {
                *state = LifecycleState::Loading;
                true
            } else {
                false
            }
        });
        if claimed {
            let session = Arc::clone(self);
            tokio::spawn(async move { session.run_load().await });
        }

        // Anything but Loading: settled, or back to Unloaded by a shutdown
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|state| !matches!(state, LifecycleState::Loading))
            .await
            .map(|state| state.clone())
            .map_err(|_| self.not_ready(LifecycleState::Loading))?;
        match settled {
            LifecycleState::Ready => Ok(()),
            other => Err(self.not_ready(other)),
        }
    }

    async fn run_load(self: Arc<Self>) {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let started = std::time::Instant::now();
        info!(
            "{} Loading model {} ({} backend)",
            prefix::OPEN,
            self.loader.model_path(),
            self.kind
        );

        let loader = Arc::clone(&self.loader);
        let loaded = tokio::task::spawn_blocking(move || loader.load())
            .await
            .unwrap_or_else(|e| Err(RuntimeError::ModelLoad(format!("load task failed: {}", e))));

        match loaded {
            Ok(model) => {
                // Install and publish under the runtime lock so a concurrent
                // shutdown either sees the runtime or stops us from starting it
                let mut slot = self.runtime.write();
                if self.closed.load(Ordering::SeqCst) {
                    drop(slot);
                    drop(model);
                    self.state.send_replace(LifecycleState::Unloaded);
                    info!("{} Shut down during load, model dropped", prefix::CLOSE);
                    return;
                }
                *slot = Some(Arc::new(ModelRuntime::start(self.kind, model, &self.settings)));
                self.state.send_replace(LifecycleState::Ready);
                drop(slot);
                info!(
                    "{} Model ready in {:.1}s",
                    prefix::OPEN,
                    started.elapsed().as_secs_f64()
                );
            }
            Err(e) => {
                error!("{} Model load failed: {}", prefix::OPEN, e);
                self.state.send_replace(LifecycleState::Failed {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Make sure the session is Ready before a request does any work.
    ///
    /// Triggers the load when Unloaded and waits at most `load_wait` for a
    /// load in progress.
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.not_ready(LifecycleState::Unloaded));
        }
        match self.state() {
            LifecycleState::Ready => return Ok(()),
            LifecycleState::Failed { .. } => return Err(self.not_ready(self.state())),
            LifecycleState::Unloaded | LifecycleState::Loading => {}
        }
        match tokio::time::timeout(self.load_wait, self.load()).await {
            Ok(result) => result,
            Err(_) => Err(self.not_ready(self.state())),
        }
    }

    /// Run one generation on the active runtime.
    ///
    /// Bounded by the generation timeout and, when given, by `deadline`.
    pub async fn generate(&self, input: GenerationInput, deadline: Option<Instant>) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.not_ready(LifecycleState::Unloaded));
        }
        let runtime = self
            .runtime
            .read()
            .clone()
            .ok_or_else(|| self.not_ready(self.state()))?;

        let mut limit = self.settings.generation_timeout();
        if let Some(deadline) = deadline {
            limit = limit.min(deadline.saturating_duration_since(Instant::now()));
        }

        match tokio::time::timeout(limit, runtime.generate(input)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(e.into_error(self.kind)),
            Err(_) => Err(Error::GenerationTimeout {
                backend: self.kind,
                after: limit,
            }),
        }
    }

    /// Stop the runtime and drop the model. Later requests get `ModelNotReady`.
    ///
    /// A load still in progress finishes in the background and is discarded.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let runtime = self.runtime.write().take();
        if let Some(runtime) = runtime {
            runtime.shutdown();
            info!("{} Model unloaded", prefix::CLOSE);
        }
        self.state.send_if_modified(|state| {
            if state.is_ready() {
                *state = LifecycleState::Unloaded;
                true
            } else {
                false
            }
        });
    }
}
