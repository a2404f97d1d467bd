//! Types shared between the preprocessing engine and the model runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Execution strategy of the model runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Concurrent submission, batched internally by the runtime
    #[serde(alias = "vllm", alias = "fast_batch")]
    FastBatch,
    /// Single-tenant execution, one generation in flight at a time
    #[default]
    #[serde(alias = "hf")]
    Direct,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::FastBatch => "fast-batch",
            BackendKind::Direct => "direct",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast-batch" | "fast_batch" | "fastbatch" | "vllm" => Ok(BackendKind::FastBatch),
            "direct" | "hf" => Ok(BackendKind::Direct),
            other => Err(Error::Config(format!(
                "invalid model backend '{}': expected 'fast-batch' (vllm) or 'direct' (hf)",
                other
            ))),
        }
    }
}

/// Lifecycle of the process-wide model session.
///
/// Transitions are `Unloaded -> Loading -> Ready` or
/// `Unloaded -> Loading -> Failed`. `Failed` is terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Unloaded,
    Loading,
    Ready,
    Failed { reason: String },
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Unloaded => "unloaded",
            LifecycleState::Loading => "loading",
            LifecycleState::Ready => "ready",
            LifecycleState::Failed { .. } => "failed",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LifecycleState::Ready)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LifecycleState::Failed { .. })
    }

    /// Ready or Failed: no further transition will happen on its own.
    pub fn is_settled(&self) -> bool {
        self.is_ready() || self.is_failed()
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Failed { reason } => write!(f, "failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Video decode backends, listed in the order they should be tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecoderKind {
    /// In-process libav decoding (requires the `ffmpeg` feature)
    Ffmpeg,
    /// `ffprobe` / `ffmpeg` subprocesses
    FfmpegCli,
    /// Directory of pre-extracted frame images
    Frames,
}

impl DecoderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecoderKind::Ffmpeg => "ffmpeg",
            DecoderKind::FfmpegCli => "ffmpeg-cli",
            DecoderKind::Frames => "frames",
        }
    }
}

impl fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecoderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ffmpeg" => Ok(DecoderKind::Ffmpeg),
            "ffmpeg-cli" | "ffmpeg_cli" | "cli" => Ok(DecoderKind::FfmpegCli),
            "frames" | "image-sequence" => Ok(DecoderKind::Frames),
            other => Err(Error::Config(format!("unknown decode backend '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_aliases() {
        assert_eq!("vllm".parse::<BackendKind>().unwrap(), BackendKind::FastBatch);
        assert_eq!("hf".parse::<BackendKind>().unwrap(), BackendKind::Direct);
        assert_eq!(" Direct ".parse::<BackendKind>().unwrap(), BackendKind::Direct);
        assert!("tensorrt".parse::<BackendKind>().is_err());

        let kind: BackendKind = serde_json::from_str("\"vllm\"").unwrap();
        assert_eq!(kind, BackendKind::FastBatch);
    }

    #[test]
    fn test_lifecycle_state_flags() {
        assert!(!LifecycleState::Unloaded.is_settled());
        assert!(!LifecycleState::Loading.is_settled());
        assert!(LifecycleState::Ready.is_settled());

        let failed = LifecycleState::Failed {
            reason: "out of memory".to_string(),
        };
        assert!(failed.is_failed());
        assert_eq!(failed.to_string(), "failed (out of memory)");
        assert_eq!(failed.name(), "failed");
    }

    #[test]
    fn test_decoder_kind_parsing() {
        assert_eq!("ffmpeg-cli".parse::<DecoderKind>().unwrap(), DecoderKind::FfmpegCli);
        assert_eq!("frames".parse::<DecoderKind>().unwrap(), DecoderKind::Frames);
        assert!("decord".parse::<DecoderKind>().is_err());
    }
}
