//! Tensor assembly: decode selected frames, resize, normalize, stack.

use image::imageops::{self, FilterType};
use image::RgbImage;
use truvlm::config::VisionSettings;
use truvlm::Stage;

use crate::cancel::CancelFlag;
use crate::error::{Result, VideoError};
use crate::source::OpenedVideo;
use crate::types::{FrameBatch, FrameSelection, ResolutionPlan};

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub image_patch_size: u32,
    pub temporal_patch_size: usize,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Fail on selected frames the stream does not contain instead of
    /// padding them from the nearest decoded frame
    pub strict: bool,
}

impl AssemblerConfig {
    pub fn from_settings(vision: &VisionSettings, strict: bool) -> Self {
        Self {
            image_patch_size: vision.image_patch_size,
            temporal_patch_size: vision.temporal_patch_size,
            mean: vision.image_mean,
            std: vision.image_std,
            strict,
        }
    }
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self::from_settings(&VisionSettings::default(), false)
    }
}

fn normalize_into(image: &RgbImage, out: &mut [f32], config: &AssemblerConfig) {
    let plane = (image.width() * image.height()) as usize;
    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..3 {
            out[c * plane + i] = (pixel[c] as f32 / 255.0 - config.mean[c]) / config.std[c];
        }
    }
}

/// Nearest filled output position to `t`, comparing native indices.
fn nearest_filled(indices: &[usize], filled: &[bool], t: usize) -> Option<usize> {
    (0..indices.len())
        .filter(|&s| filled[s])
        .min_by_key(|&s| (indices[s].abs_diff(indices[t]), s))
}

/// Build the frame batch for one request.
///
/// Only the distinct selected indices are decoded; repeats in the
/// selection and temporal padding reuse the already normalized frame.
pub fn assemble(
    video: &mut OpenedVideo,
    selection: &FrameSelection,
    plan: &ResolutionPlan,
    config: &AssemblerConfig,
    cancel: &CancelFlag,
) -> Result<FrameBatch> {
    let selected = selection.len();
    if selected == 0 {
        return Err(VideoError::Empty);
    }
    let frames = plan.frames.max(selected);
    let (width, height) = (plan.width, plan.height);
    let frame_len = 3 * width as usize * height as usize;

    let mut data = vec![0f32; frames * frame_len];
    let mut filled = vec![false; selected];
    let indices = &selection.indices;
    let unique = selection.unique();

    let mut pos = 0;
    video.handle.read_frames(&unique, cancel, &mut |frame| {
        cancel.check(Stage::Assemble)?;
        while pos < selected && indices[pos] < frame.index {
            pos += 1;
        }
        let start = pos;
        while pos < selected && indices[pos] == frame.index {
            pos += 1;
        }
        if start == pos {
            return Ok(());
        }

        let resized = if frame.width() == width && frame.height() == height {
            frame.image
        } else {
            imageops::resize(&frame.image, width, height, FilterType::CatmullRom)
        };
        normalize_into(&resized, &mut data[start * frame_len..(start + 1) * frame_len], config);
        for t in start + 1..pos {
            data.copy_within(start * frame_len..(start + 1) * frame_len, t * frame_len);
        }
        filled[start..pos].iter_mut().for_each(|f| *f = true);
        Ok(())
    })?;

    let missing: Vec<usize> = (0..selected).filter(|&t| !filled[t]).collect();
    if missing.len() == selected {
        return Err(VideoError::decode(video.backend, "no selected frame could be decoded"));
    }
    if !missing.is_empty() {
        if config.strict {
            return Err(VideoError::MissingFrame {
                backend: video.backend,
                index: indices[missing[0]],
            });
        }
        tracing::warn!(
            backend = video.backend,
            missing = missing.len(),
            first = indices[missing[0]],
            "selected frames absent from stream, padding from nearest decoded frame"
        );
        for &t in &missing {
            if let Some(src) = nearest_filled(indices, &filled, t) {
                data.copy_within(src * frame_len..(src + 1) * frame_len, t * frame_len);
            }
        }
    }

    for t in selected..frames {
        data.copy_within((selected - 1) * frame_len..selected * frame_len, t * frame_len);
    }

    let patch = config.image_patch_size as usize;
    let tps = config.temporal_patch_size.max(1);
    Ok(FrameBatch {
        data,
        frames,
        channels: 3,
        height,
        width,
        grid_thw: [frames / tps, height as usize / patch, width as usize / patch],
        sample_fps: selection.sample_fps,
    })
}
