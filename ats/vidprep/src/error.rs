//! Preprocessing errors.

use std::time::Duration;
use thiserror::Error;
use truvlm::Stage;

/// One failed decode backend attempt, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct FailedAttempt {
    pub backend: &'static str,
    pub reason: String,
    /// The backend did not recognize the container, codec or protocol
    pub unsupported: bool,
}

#[derive(Error, Debug)]
pub enum VideoError {
    /// Backend does not handle this kind of source
    #[error("{backend}: unsupported source: {message}")]
    Unsupported {
        backend: &'static str,
        message: String,
    },

    /// Backend recognized the source but failed to open it
    #[error("{backend}: {message}")]
    Unreadable {
        backend: &'static str,
        message: String,
    },

    #[error("{backend}: open timed out after {after:?}")]
    Timeout {
        backend: &'static str,
        after: Duration,
    },

    /// Every configured backend failed
    #[error("all decode backends failed: {}", summarize(.attempts))]
    Exhausted { attempts: Vec<FailedAttempt> },

    /// The request deadline passed while the video was being opened
    #[error("request deadline exceeded while opening the video")]
    DeadlineExceeded { attempts: Vec<FailedAttempt> },

    /// Decoding failed after the source was opened
    #[error("{backend}: decode failed: {message}")]
    Decode {
        backend: &'static str,
        message: String,
    },

    /// The request deadline passed while the selected frames were decoding
    #[error("{backend}: request deadline exceeded while decoding frames")]
    DecodeDeadline { backend: &'static str },

    /// A selected frame is missing and padding is disabled
    #[error("{backend}: frame {index} could not be decoded")]
    MissingFrame { backend: &'static str, index: usize },

    #[error("video has no decodable frames")]
    Empty,

    #[error("{0}")]
    PixelBudget(String),

    #[error("cancelled during {0}")]
    Cancelled(Stage),
}

fn summarize(attempts: &[FailedAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.backend, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, VideoError>;

impl VideoError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, VideoError::Unsupported { .. })
    }

    pub(crate) fn unsupported(backend: &'static str, message: impl Into<String>) -> Self {
        VideoError::Unsupported {
            backend,
            message: message.into(),
        }
    }

    pub(crate) fn unreadable(backend: &'static str, message: impl Into<String>) -> Self {
        VideoError::Unreadable {
            backend,
            message: message.into(),
        }
    }

    pub(crate) fn decode(backend: &'static str, message: impl Into<String>) -> Self {
        VideoError::Decode {
            backend,
            message: message.into(),
        }
    }
}

impl From<VideoError> for truvlm::Error {
    fn from(err: VideoError) -> Self {
        let message = err.to_string();
        match err {
            VideoError::Unsupported { backend, .. } => truvlm::Error::UnsupportedFormat {
                message,
                attempted: vec![backend.to_string()],
            },
            VideoError::Unreadable { backend, .. } | VideoError::Timeout { backend, .. } => {
                truvlm::Error::VideoUnreadable {
                    stage: Stage::Resolve,
                    backend: Some(backend.to_string()),
                    message,
                }
            }
            VideoError::Exhausted { attempts } => {
                let attempted: Vec<String> =
                    attempts.iter().map(|a| a.backend.to_string()).collect();
                if attempts.iter().all(|a| a.unsupported) {
                    truvlm::Error::UnsupportedFormat { message, attempted }
                } else {
                    truvlm::Error::VideoUnreadable {
                        stage: Stage::Resolve,
                        backend: Some(attempted.join(",")),
                        message,
                    }
                }
            }
            VideoError::DeadlineExceeded { attempts } => truvlm::Error::VideoUnreadable {
                stage: Stage::Resolve,
                backend: attempts.last().map(|a| a.backend.to_string()),
                message,
            },
            VideoError::Decode { backend, .. }
            | VideoError::DecodeDeadline { backend }
            | VideoError::MissingFrame { backend, .. } => {
                truvlm::Error::VideoUnreadable {
                    stage: Stage::Assemble,
                    backend: Some(backend.to_string()),
                    message,
                }
            }
            VideoError::Empty => truvlm::Error::VideoUnreadable {
                stage: Stage::Sample,
                backend: None,
                message,
            },
            VideoError::PixelBudget(detail) => truvlm::Error::PixelBudgetUnsatisfiable(detail),
            VideoError::Cancelled(stage) => truvlm::Error::Cancelled { stage },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use truvlm::ErrorKind;

    fn attempt(backend: &'static str, unsupported: bool) -> FailedAttempt {
        FailedAttempt {
            backend,
            reason: "boom".to_string(),
            unsupported,
        }
    }

    #[test]
    fn test_exhausted_all_unsupported_maps_to_unsupported_format() {
        let err: truvlm::Error = VideoError::Exhausted {
            attempts: vec![attempt("ffmpeg-cli", true), attempt("frames", true)],
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
        assert_eq!(err.backend().as_deref(), Some("ffmpeg-cli,frames"));
    }

    #[test]
    fn test_exhausted_with_real_failure_maps_to_unreadable() {
        let err: truvlm::Error = VideoError::Exhausted {
            attempts: vec![attempt("ffmpeg-cli", false), attempt("frames", true)],
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::VideoUnreadable);
        assert_eq!(err.stage(), Stage::Resolve);
        assert!(err.to_string().contains("ffmpeg-cli (boom)"));
    }

    #[test]
    fn test_stage_scoped_conversions() {
        let err: truvlm::Error = VideoError::MissingFrame {
            backend: "frames",
            index: 7,
        }
        .into();
        assert_eq!(err.stage(), Stage::Assemble);

        let err: truvlm::Error = VideoError::DecodeDeadline { backend: "ffmpeg-cli" }.into();
        assert_eq!(err.kind(), ErrorKind::VideoUnreadable);
        assert_eq!(err.stage(), Stage::Assemble);
        assert_eq!(err.backend().as_deref(), Some("ffmpeg-cli"));

        let err: truvlm::Error = VideoError::Empty.into();
        assert_eq!(err.stage(), Stage::Sample);

        let err: truvlm::Error = VideoError::PixelBudget("too small".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::PixelBudgetUnsatisfiable);

        let err: truvlm::Error = VideoError::Cancelled(Stage::Assemble).into();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
