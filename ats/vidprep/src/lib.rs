//! truvlm video preprocessing
//!
//! Turns a video reference into the frame batch consumed by the model
//! runtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌────────────────┐   ┌─────────┐   ┌─────────┐   ┌───────────┐
//! │ VideoSource │──▶│ SourceResolver │──▶│ sampler │──▶│ planner │──▶│ assembler │──▶ FrameBatch
//! │ (url/path)  │   │ (fallback)     │   │ indices │   │ h × w   │   │ [T,C,H,W] │
//! └─────────────┘   └────────────────┘   └─────────┘   └─────────┘   └───────────┘
//! ```
//!
//! ## Decode backends
//!
//! - `ffmpeg`: in-process libav decoding (feature `ffmpeg`)
//! - `ffmpeg-cli`: `ffprobe`/`ffmpeg` subprocesses, always available
//! - `frames`: directories of pre-extracted frame images
//!
//! ## Usage
//!
//! ```rust,ignore
//! let pre = Preprocessor::from_settings(&settings)?;
//! let batch = pre.run(&source, &constraints, &CancelFlag::new(), None).await?;
//! ```

pub mod assembler;
pub mod backends;
pub mod cancel;
pub mod error;
pub mod pipeline;
pub mod planner;
pub mod sampler;
pub mod source;
pub mod types;

pub use assembler::AssemblerConfig;
pub use cancel::CancelFlag;
pub use error::{FailedAttempt, VideoError};
pub use pipeline::Preprocessor;
pub use planner::PatchGeometry;
pub use source::{DecodeBackend, DecodeHandle, OpenedVideo, SourceResolver};
pub use types::{DecodedFrame, FrameBatch, FrameSelection, ResolutionPlan, VideoMetadata};
