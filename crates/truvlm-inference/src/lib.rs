//! truvlm inference core
//!
//! Owns the process-wide model session and serves video + prompt requests
//! through one of two runtime strategies:
//!
//! - **FastBatch**: concurrent submission, batched by a worker task
//! - **Direct**: one generation on the device at a time, callers queue
//!
//! The [`Orchestrator`] validates a request, runs the preprocessing
//! pipeline from `truvlm-vidprep` and hands the frame batch to the active
//! runtime.

pub mod backends;
pub mod error;
pub mod model;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod orchestrator;
pub mod session;

pub use backends::{BatchConfig, DirectBackend, FastBatchBackend, ModelRuntime};
pub use error::RuntimeError;
pub use model::{default_loader, GenerationInput, ModelLoader, VisionLanguageModel};
pub use orchestrator::{Orchestrator, ReleaseHook};
pub use session::{ModelSession, Readiness};
