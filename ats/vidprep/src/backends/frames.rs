//! Directories of pre-extracted frame images.
//!
//! Frames are ordered by file name and played back at a configured rate.

use std::path::{Path, PathBuf};

use truvlm::{Stage, VideoSource};

use crate::cancel::CancelFlag;
use crate::error::{Result, VideoError};
use crate::source::{DecodeBackend, DecodeHandle};
use crate::types::{DecodedFrame, VideoMetadata};

const NAME: &str = "frames";
const EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];

pub struct FrameDirectoryBackend {
    fps: f64,
}

impl FrameDirectoryBackend {
    pub fn new(fps: f64) -> Self {
        Self { fps }
    }
}

fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| VideoError::unreadable(NAME, format!("{}: {}", dir.display(), e)))?;

    let mut frames = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| VideoError::unreadable(NAME, e.to_string()))?
            .path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

impl DecodeBackend for FrameDirectoryBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, source: &VideoSource, cancel: &CancelFlag) -> Result<Box<dyn DecodeHandle>> {
        let dir = match source.local_path() {
            Some(path) if path.is_dir() => path,
            Some(_) => return Err(VideoError::unsupported(NAME, "source is not a directory")),
            None => return Err(VideoError::unsupported(NAME, "remote sources are not supported")),
        };
        cancel.check(Stage::Resolve)?;

        let frames = list_frames(dir)?;
        let first = frames
            .first()
            .ok_or_else(|| VideoError::unsupported(NAME, "directory contains no frame images"))?;
        let (width, height) = image::image_dimensions(first)
            .map_err(|e| VideoError::unreadable(NAME, format!("{}: {}", first.display(), e)))?;

        Ok(Box::new(FrameDirectoryHandle {
            metadata: VideoMetadata {
                width,
                height,
                fps: self.fps,
                frame_count: frames.len(),
            },
            frames,
        }))
    }
}

struct FrameDirectoryHandle {
    metadata: VideoMetadata,
    frames: Vec<PathBuf>,
}

impl DecodeHandle for FrameDirectoryHandle {
    fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    fn read_frames(
        &mut self,
        indices: &[usize],
        cancel: &CancelFlag,
        sink: &mut dyn FnMut(DecodedFrame) -> Result<()>,
    ) -> Result<()> {
        for &index in indices {
            cancel.check(Stage::Assemble)?;
            let Some(path) = self.frames.get(index) else {
                continue;
            };
            let image = image::open(path)
                .map_err(|e| VideoError::decode(NAME, format!("{}: {}", path.display(), e)))?
                .to_rgb8();
            sink(DecodedFrame {
                index,
                timestamp: index as f64 / self.metadata.fps,
                image,
            })?;
        }
        Ok(())
    }
}
