//! Core types for video preprocessing
//!
//! `FrameBatch` is the contract between preprocessing and the model
//! runtime: every runtime backend consumes exactly this layout.

use image::RgbImage;
use serde::Serialize;

/// Properties of an opened video stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    /// Native frames per second
    pub fps: f64,
    /// Native frame count (estimated from duration when the container does not say)
    pub frame_count: usize,
}

impl VideoMetadata {
    /// Duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.fps > 0.0 {
            self.frame_count as f64 / self.fps
        } else {
            0.0
        }
    }
}

/// A frame decoded at native resolution.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Native frame index
    pub index: usize,
    /// Presentation time in seconds
    pub timestamp: f64,
    pub image: RgbImage,
}

impl DecodedFrame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Which native frames to extract, in output order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSelection {
    /// Native indices, non-decreasing, possibly repeating
    pub indices: Vec<usize>,
    /// Effective sampling rate of the selection
    pub sample_fps: f64,
}

impl FrameSelection {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Distinct indices to decode, ascending.
    pub fn unique(&self) -> Vec<usize> {
        let mut unique = self.indices.clone();
        unique.dedup();
        unique
    }
}

/// Uniform target resolution for every frame of a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolutionPlan {
    pub width: u32,
    pub height: u32,
    /// Frame count after temporal padding
    pub frames: usize,
    /// Per-frame pixel allowance the plan was fitted into
    pub per_frame_budget: u64,
}

impl ResolutionPlan {
    pub fn pixels_per_frame(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn total_pixels(&self) -> u64 {
        self.pixels_per_frame() * self.frames as u64
    }

    /// Bytes held by the assembled f32 RGB batch.
    pub fn batch_bytes(&self) -> u64 {
        self.total_pixels() * 3 * std::mem::size_of::<f32>() as u64
    }
}

/// Resized, normalized frames plus grid metadata, laid out `[T, C, H, W]`.
#[derive(Debug, Clone)]
pub struct FrameBatch {
    pub data: Vec<f32>,
    pub frames: usize,
    pub channels: usize,
    pub height: u32,
    pub width: u32,
    /// Patch counts `[temporal, height, width]`
    pub grid_thw: [usize; 3],
    pub sample_fps: f64,
}

impl FrameBatch {
    pub fn shape(&self) -> [usize; 4] {
        [
            self.frames,
            self.channels,
            self.height as usize,
            self.width as usize,
        ]
    }

    /// Values of one frame, `[C, H, W]`.
    pub fn frame(&self, t: usize) -> &[f32] {
        let stride = self.channels * self.height as usize * self.width as usize;
        &self.data[t * stride..(t + 1) * stride]
    }

    /// Number of vision patches before spatial merging.
    pub fn num_patches(&self) -> usize {
        self.grid_thw.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}
