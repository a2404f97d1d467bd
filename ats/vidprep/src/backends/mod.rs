//! Decode backends.

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod ffmpeg_cli;
pub mod frames;

use std::sync::Arc;

use truvlm::config::DecodeSettings;
use truvlm::DecoderKind;

use crate::source::DecodeBackend;

pub use ffmpeg_cli::FfmpegCliBackend;
pub use frames::FrameDirectoryBackend;

/// Instantiate the configured backends in priority order.
///
/// Backends compiled out of this build are skipped with a warning; an
/// empty result is a configuration error.
pub fn build(settings: &DecodeSettings) -> truvlm::Result<Vec<Arc<dyn DecodeBackend>>> {
    let mut backends: Vec<Arc<dyn DecodeBackend>> = Vec::with_capacity(settings.backends.len());

    for kind in &settings.backends {
        match kind {
            DecoderKind::Ffmpeg => {
                #[cfg(feature = "ffmpeg")]
                backends.push(Arc::new(ffmpeg::FfmpegBackend::new()));
                #[cfg(not(feature = "ffmpeg"))]
                tracing::warn!("decode backend 'ffmpeg' requires the ffmpeg feature, skipping");
            }
            DecoderKind::FfmpegCli => {
                backends.push(Arc::new(FfmpegCliBackend::new(settings.attempt_timeout())))
            }
            DecoderKind::Frames => {
                backends.push(Arc::new(FrameDirectoryBackend::new(settings.frames_fps)))
            }
        }
    }

    if backends.is_empty() {
        return Err(truvlm::Error::Config(format!(
            "none of the configured decode backends [{}] are available in this build",
            settings
                .backends
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    Ok(backends)
}
