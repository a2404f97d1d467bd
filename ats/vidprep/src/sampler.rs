//! Frame sampling.
//!
//! Frame counts use `round()` (half away from zero); indices are spread
//! evenly over the native frames so the first and last are always kept.

use truvlm::VideoConstraints;

use crate::error::{Result, VideoError};
use crate::types::{FrameSelection, VideoMetadata};

/// Number of frames to sample.
///
/// `explicit` wins over the rate; the result is clamped to
/// `[min_frames, max_frames]`.
pub fn frame_count(
    duration_secs: f64,
    fps: f64,
    explicit: Option<usize>,
    min_frames: usize,
    max_frames: usize,
) -> usize {
    let target = match explicit {
        Some(n) => n,
        None => {
            let raw = (duration_secs * fps).round();
            if raw.is_finite() && raw > 0.0 {
                raw as usize
            } else {
                0
            }
        }
    };
    target.max(min_frames).min(max_frames)
}

/// `index(i) = round(i * (native_count - 1) / (nframes - 1))` for `i` in `0..nframes`.
///
/// Collisions are kept as repeats so the selection always has exactly
/// `nframes` entries.
pub fn frame_indices(native_count: usize, nframes: usize) -> Vec<usize> {
    if nframes == 0 || native_count == 0 {
        return Vec::new();
    }
    if nframes == 1 {
        return vec![0];
    }
    let last = (native_count - 1) as u64;
    let steps = (nframes - 1) as u64;
    (0..nframes as u64)
        // round(a / b) == (2a + b) / 2b for non-negative integers
        .map(|i| ((2 * i * last + steps) / (2 * steps)) as usize)
        .collect()
}

/// Largest frame count within `max_frames` that fills whole temporal
/// patches, so padding the batch never grows it past `max_frames`.
pub fn frame_ceiling(max_frames: usize, temporal_patch_size: usize) -> usize {
    let t = temporal_patch_size.max(1);
    (max_frames / t * t).max(1)
}

/// Select the frames of `meta` to extract under `constraints`.
///
/// `min_frames` must be a multiple of `temporal_patch_size`.
pub fn sample(
    meta: &VideoMetadata,
    constraints: &VideoConstraints,
    min_frames: usize,
    temporal_patch_size: usize,
) -> Result<FrameSelection> {
    if meta.frame_count == 0 {
        return Err(VideoError::Empty);
    }

    let nframes = frame_count(
        meta.duration_secs(),
        constraints.fps,
        constraints.nframes,
        min_frames,
        frame_ceiling(constraints.max_frames, temporal_patch_size),
    );
    let indices = frame_indices(meta.frame_count, nframes);
    let sample_fps = nframes as f64 / meta.frame_count as f64 * meta.fps;

    tracing::debug!(
        native_frames = meta.frame_count,
        native_fps = meta.fps,
        nframes,
        sample_fps,
        "frames selected"
    );

    Ok(FrameSelection {
        indices,
        sample_fps,
    })
}
