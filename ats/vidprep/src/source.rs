//! Video source resolution with ordered backend fallback.
//!
//! ```text
//! VideoSource ──▶ backend[0] ──timeout/error──▶ backend[1] ──▶ ... ──▶ Exhausted
//!                     │                             │
//!                     └──────── OpenedVideo ◀───────┘
//! ```
//!
//! Each attempt runs on the blocking pool under its own child
//! [`CancelFlag`]. A timed-out attempt is cancelled and abandoned; whatever
//! it eventually produces is dropped on the blocking thread, so nothing
//! from it reaches the next attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use truvlm::config::DecodeSettings;
use truvlm::tracing::prefix;
use truvlm::{Stage, VideoSource};

use crate::backends;
use crate::cancel::CancelFlag;
use crate::error::{FailedAttempt, Result, VideoError};
use crate::types::{DecodedFrame, VideoMetadata};

/// A decode backend that may be able to open a source.
///
/// `open` is blocking; the resolver runs it on the blocking pool.
pub trait DecodeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open `source` and probe its metadata.
    ///
    /// Returns [`VideoError::Unsupported`] when the container, codec or
    /// protocol is not handled by this backend.
    fn open(&self, source: &VideoSource, cancel: &CancelFlag) -> Result<Box<dyn DecodeHandle>>;
}

/// An opened video, owned by exactly one request.
pub trait DecodeHandle: Send {
    fn metadata(&self) -> &VideoMetadata;

    /// Decode the frames at `indices` (ascending, distinct) and hand each
    /// one to `sink` in order.
    ///
    /// Frames the stream turns out not to contain are skipped; corrupt data
    /// is an error. An error from `sink` stops decoding and is returned.
    fn read_frames(
        &mut self,
        indices: &[usize],
        cancel: &CancelFlag,
        sink: &mut dyn FnMut(DecodedFrame) -> Result<()>,
    ) -> Result<()>;
}

/// Result of a successful resolve.
pub struct OpenedVideo {
    pub handle: Box<dyn DecodeHandle>,
    pub metadata: VideoMetadata,
    pub backend: &'static str,
}

impl std::fmt::Debug for OpenedVideo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedVideo")
            .field("metadata", &self.metadata)
            .field("backend", &self.backend)
            .finish()
    }
}

/// Tries decode backends in priority order.
pub struct SourceResolver {
    backends: Vec<Arc<dyn DecodeBackend>>,
    attempt_timeout: Duration,
}

impl SourceResolver {
    pub fn new(backends: Vec<Arc<dyn DecodeBackend>>, attempt_timeout: Duration) -> Self {
        Self {
            backends,
            attempt_timeout,
        }
    }

    /// Build the configured backend list.
    pub fn from_settings(settings: &DecodeSettings) -> truvlm::Result<Self> {
        let backends = backends::build(settings)?;
        Ok(Self::new(backends, settings.attempt_timeout()))
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Open `source` with the first backend that succeeds in time.
    ///
    /// Each attempt is bounded by the attempt timeout and, when given, by
    /// `deadline`. Passing the deadline fails the request instead of
    /// advancing to the next backend.
    pub async fn open(
        &self,
        source: &VideoSource,
        cancel: &CancelFlag,
        deadline: Option<Instant>,
    ) -> Result<OpenedVideo> {
        let mut attempts = Vec::with_capacity(self.backends.len());

        for backend in &self.backends {
            cancel.check(Stage::Resolve)?;
            let name = backend.name();

            let mut limit = self.attempt_timeout;
            let mut bounded_by_deadline = false;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(VideoError::DeadlineExceeded { attempts });
                }
                if remaining < limit {
                    limit = remaining;
                    bounded_by_deadline = true;
                }
            }

            let attempt_cancel = cancel.child();
            let task = {
                let backend = Arc::clone(backend);
                let source = source.clone();
                let attempt_cancel = attempt_cancel.clone();
                tokio::task::spawn_blocking(move || backend.open(&source, &attempt_cancel))
            };

            let started = std::time::Instant::now();
            let outcome = match tokio::time::timeout(limit, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(VideoError::unreadable(
                    name,
                    format!("decode task failed: {}", join_err),
                )),
                Err(_) => {
                    attempt_cancel.cancel();
                    Err(VideoError::Timeout { backend: name, after: limit })
                }
            };

            match outcome {
                Ok(handle) => {
                    let metadata = handle.metadata().clone();
                    tracing::debug!(
                        backend = name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        width = metadata.width,
                        height = metadata.height,
                        fps = metadata.fps,
                        frames = metadata.frame_count,
                        "{} video opened",
                        prefix::DECODE
                    );
                    return Ok(OpenedVideo {
                        handle,
                        metadata,
                        backend: name,
                    });
                }
                Err(VideoError::Cancelled(stage)) if cancel.is_cancelled() => {
                    return Err(VideoError::Cancelled(stage));
                }
                Err(err) => {
                    let unsupported = err.is_unsupported();
                    let timed_out = matches!(err, VideoError::Timeout { .. });
                    if unsupported {
                        tracing::debug!(backend = name, error = %err, "backend declined source");
                    } else {
                        tracing::warn!(
                            backend = name,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            error = %err,
                            "{} decode attempt failed",
                            prefix::DECODE
                        );
                    }
                    attempts.push(FailedAttempt {
                        backend: name,
                        reason: err.to_string(),
                        unsupported,
                    });
                    if timed_out && bounded_by_deadline {
                        return Err(VideoError::DeadlineExceeded { attempts });
                    }
                }
            }
        }

        Err(VideoError::Exhausted { attempts })
    }
}
