//! Caller-facing error kinds for truvlm requests.
//!
//! Stage-local errors (`VideoError`, `RuntimeError`) are converted into this
//! type at crate boundaries so that the transport layer only has to deal
//! with one set of kinds.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::types::{BackendKind, LifecycleState};

/// Pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Resolve,
    Sample,
    Plan,
    Assemble,
    Load,
    Generate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Resolve => "resolve",
            Stage::Sample => "sample",
            Stage::Plan => "plan",
            Stage::Assemble => "assemble",
            Stage::Load => "load",
            Stage::Generate => "generate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable discriminant of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    VideoUnreadable,
    UnsupportedFormat,
    PixelBudgetUnsatisfiable,
    ModelNotReady,
    GenerationTimeout,
    GenerationFailure,
    Cancelled,
    Config,
}

/// Error returned to callers of the orchestrator.
#[derive(Error, Debug)]
pub enum Error {
    /// A request parameter is outside its declared range
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// Decode backends exhausted, timed out, or a frame failed mid-stream
    #[error("video unreadable during {stage}{}: {message}", on_backend(.backend))]
    VideoUnreadable {
        stage: Stage,
        backend: Option<String>,
        message: String,
    },

    /// No decode backend recognizes the container, codec or protocol
    #[error("unsupported video format: {message}")]
    UnsupportedFormat {
        message: String,
        attempted: Vec<String>,
    },

    /// The native resolution cannot be fit into the pixel budget
    #[error("pixel budget unsatisfiable: {0}")]
    PixelBudgetUnsatisfiable(String),

    /// The model session is not in the Ready state
    #[error("model not ready: {backend} backend is {state}")]
    ModelNotReady {
        backend: BackendKind,
        state: LifecycleState,
    },

    #[error("generation timed out on {backend} backend after {after:?}")]
    GenerationTimeout { backend: BackendKind, after: Duration },

    /// Backend error during generation (resource exhaustion, runtime fault)
    #[error("generation failed on {backend} backend: {message}")]
    GenerationFailure { backend: BackendKind, message: String },

    /// The caller went away before the request finished
    #[error("request cancelled during {stage}")]
    Cancelled { stage: Stage },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

fn on_backend(backend: &Option<String>) -> String {
    match backend {
        Some(name) => format!(" (backend {})", name),
        None => String::new(),
    }
}

/// Result type alias using truvlm Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Error::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::ValidationError,
            Error::VideoUnreadable { .. } => ErrorKind::VideoUnreadable,
            Error::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            Error::PixelBudgetUnsatisfiable(_) => ErrorKind::PixelBudgetUnsatisfiable,
            Error::ModelNotReady { .. } => ErrorKind::ModelNotReady,
            Error::GenerationTimeout { .. } => ErrorKind::GenerationTimeout,
            Error::GenerationFailure { .. } => ErrorKind::GenerationFailure,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Error::Validation { .. } => Stage::Validate,
            Error::VideoUnreadable { stage, .. } => *stage,
            Error::UnsupportedFormat { .. } => Stage::Resolve,
            Error::PixelBudgetUnsatisfiable(_) => Stage::Plan,
            Error::ModelNotReady { .. } => Stage::Load,
            Error::GenerationTimeout { .. } | Error::GenerationFailure { .. } => Stage::Generate,
            Error::Cancelled { stage } => *stage,
            Error::Config(_) => Stage::Load,
        }
    }

    /// Backend that was being used when the error happened, if any.
    pub fn backend(&self) -> Option<String> {
        match self {
            Error::VideoUnreadable { backend, .. } => backend.clone(),
            Error::UnsupportedFormat { attempted, .. } if !attempted.is_empty() => {
                Some(attempted.join(","))
            }
            Error::ModelNotReady { backend, .. }
            | Error::GenerationTimeout { backend, .. }
            | Error::GenerationFailure { backend, .. } => Some(backend.to_string()),
            _ => None,
        }
    }

    /// True when the error means the whole process can no longer serve.
    ///
    /// Only a session that failed to load qualifies; every other kind is
    /// scoped to the request that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ModelNotReady {
                state: LifecycleState::Failed { .. },
                ..
            }
        )
    }

    /// HTTP status a transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::ValidationError => 400,
            ErrorKind::UnsupportedFormat => 415,
            ErrorKind::VideoUnreadable | ErrorKind::PixelBudgetUnsatisfiable => 422,
            ErrorKind::Cancelled => 499,
            ErrorKind::GenerationFailure | ErrorKind::Config => 500,
            ErrorKind::ModelNotReady => 503,
            ErrorKind::GenerationTimeout => 504,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            kind: self.kind(),
            message: self.to_string(),
            stage: self.stage(),
            backend: self.backend(),
            fatal: self.is_fatal(),
        }
    }
}

/// Error body handed to the transport layer.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    pub fatal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_unreadable_message_names_backend() {
        let err = Error::VideoUnreadable {
            stage: Stage::Resolve,
            backend: Some("ffmpeg-cli".to_string()),
            message: "all decode backends failed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "video unreadable during resolve (backend ffmpeg-cli): all decode backends failed"
        );
        assert_eq!(err.status_code(), 422);
        assert_eq!(err.backend().as_deref(), Some("ffmpeg-cli"));
    }

    #[test]
    fn test_only_failed_session_is_fatal() {
        let loading = Error::ModelNotReady {
            backend: BackendKind::Direct,
            state: LifecycleState::Loading,
        };
        assert!(!loading.is_fatal());
        assert_eq!(loading.status_code(), 503);

        let failed = Error::ModelNotReady {
            backend: BackendKind::Direct,
            state: LifecycleState::Failed {
                reason: "weights missing".to_string(),
            },
        };
        assert!(failed.is_fatal());
        assert!(failed.to_response().fatal);

        let timeout = Error::GenerationTimeout {
            backend: BackendKind::FastBatch,
            after: Duration::from_secs(30),
        };
        assert!(!timeout.is_fatal());
        assert_eq!(timeout.stage(), Stage::Generate);
    }

    #[test]
    fn test_error_response_serialization() {
        let err = Error::validation("temperature", "must be between 0.0 and 2.0, got 3");
        let body = serde_json::to_value(err.to_response()).unwrap();
        assert_eq!(body["kind"], "validation_error");
        assert_eq!(body["stage"], "validate");
        assert!(body.get("backend").is_none());
    }
}
