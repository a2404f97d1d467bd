//! Model runtime errors.

use thiserror::Error;
use truvlm::{BackendKind, LifecycleState};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("failed to load tokenizer: {0}")]
    TokenizerLoad(String),

    #[error("model not loaded")]
    ModelNotLoaded,

    #[error("tokenization failed: {0}")]
    Tokenization(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The runtime stopped accepting work
    #[error("runtime is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    /// Caller-facing error for a failure on `backend`.
    pub fn into_error(self, backend: BackendKind) -> truvlm::Error {
        match self {
            RuntimeError::ModelNotLoaded | RuntimeError::ShutDown => truvlm::Error::ModelNotReady {
                backend,
                state: LifecycleState::Unloaded,
            },
            other => truvlm::Error::GenerationFailure {
                backend,
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use truvlm::ErrorKind;

    #[test]
    fn test_runtime_errors_map_to_caller_kinds() {
        let err = RuntimeError::Generation("CUDA out of memory".to_string())
            .into_error(BackendKind::Direct);
        assert_eq!(err.kind(), ErrorKind::GenerationFailure);
        assert!(err.to_string().contains("out of memory"));
        assert!(!err.is_fatal());

        let err = RuntimeError::ShutDown.into_error(BackendKind::FastBatch);
        assert_eq!(err.kind(), ErrorKind::ModelNotReady);
        assert!(!err.is_fatal());
    }
}
