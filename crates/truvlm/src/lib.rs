//! # truvlm shared library
//!
//! Shared pieces of the video + prompt inference service:
//! - **request**: `VideoRequest`, option overrides, validated parameters, `InferenceResult`
//! - **error**: caller-facing error kinds with stage and backend context
//! - **config**: layered service settings (defaults, JSON file, environment)
//! - **types**: backend/decoder kinds and the model lifecycle state
//! - **tracing**: logging setup with segment prefixes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use truvlm::{Settings, VideoRequest, VideoSource};
//!
//! let settings = Settings::load(None)?;
//! let request = VideoRequest::new(VideoSource::parse("clip.mp4")?, "Describe the video");
//! ```

pub mod config;
pub mod error;
pub mod request;
pub mod tracing;
pub mod types;

pub use config::Settings;
pub use error::{Error, ErrorKind, ErrorResponse, Result, Stage};
pub use request::{
    GenerationOptions, GenerationParams, InferenceResult, VideoConstraints, VideoOptions,
    VideoRequest, VideoSource,
};
pub use types::{BackendKind, DecoderKind, LifecycleState};
