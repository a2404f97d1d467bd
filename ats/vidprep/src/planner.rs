//! Resolution planning under per-frame and clip-wide pixel budgets.

use truvlm::VideoConstraints;

use crate::error::{Result, VideoError};
use crate::types::ResolutionPlan;

/// Patch geometry of the vision encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGeometry {
    /// Alignment unit for frame dimensions (patch size × spatial merge)
    pub unit: u32,
    pub temporal_patch_size: usize,
}

impl PatchGeometry {
    pub fn new(unit: u32, temporal_patch_size: usize) -> Self {
        Self {
            unit,
            temporal_patch_size,
        }
    }

    /// Frame count rounded up to a whole number of temporal patches.
    pub fn padded_frames(&self, nframes: usize) -> usize {
        let t = self.temporal_patch_size.max(1);
        nframes.div_ceil(t) * t
    }
}

fn floor_to(value: f64, unit: u32) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    // 1e-9 absorbs float error when value lands on an exact multiple
    let units = (value / unit as f64 + 1e-9).floor();
    (units as u32).saturating_mul(unit)
}

/// Compute the uniform target resolution for a clip.
///
/// `per_frame_budget = clamp(total_pixels / frames, min_pixels, max_pixels)`
/// where `frames` is `nframes` padded to the temporal patch size. Frames
/// keep their native area when it fits between `min_pixels` and the budget,
/// and are scaled to the nearer bound otherwise. Each side is floored to
/// the patch unit; a side that collapses to zero is held at one unit.
pub fn plan(
    native_width: u32,
    native_height: u32,
    nframes: usize,
    constraints: &VideoConstraints,
    geometry: PatchGeometry,
) -> Result<ResolutionPlan> {
    let unit = geometry.unit;
    if native_width == 0 || native_height == 0 {
        return Err(VideoError::PixelBudget(format!(
            "native resolution {}x{} has no pixels",
            native_width, native_height
        )));
    }

    let frames = geometry.padded_frames(nframes.max(1));
    let budget = (constraints.total_pixels / frames as u64)
        .max(constraints.min_pixels)
        .min(constraints.max_pixels);
    let unit_area = unit as u64 * unit as u64;
    if unit_area > budget {
        return Err(VideoError::PixelBudget(format!(
            "one {}x{} patch unit exceeds the per-frame budget of {} pixels",
            unit, unit, budget
        )));
    }

    let (w0, h0) = (native_width as f64, native_height as f64);
    let native_area = native_width as u64 * native_height as u64;
    let target = native_area.clamp(constraints.min_pixels.min(budget), budget);
    let scale = (target as f64 / (w0 * h0)).sqrt();
    let mut width = floor_to(w0 * scale, unit);
    let mut height = floor_to(h0 * scale, unit);

    let widest = floor_to(budget as f64 / unit as f64, unit).max(unit);
    if height == 0 {
        height = unit;
        width = floor_to((w0 * unit as f64 / h0).min(budget as f64 / unit as f64), unit)
            .clamp(unit, widest);
    } else if width == 0 {
        width = unit;
        height = floor_to((h0 * unit as f64 / w0).min(budget as f64 / unit as f64), unit)
            .clamp(unit, widest);
    }

    while width as u64 * height as u64 > budget {
        if height >= width && height > unit {
            height -= unit;
        } else if width > unit {
            width -= unit;
        } else {
            break;
        }
    }

    let plan = ResolutionPlan {
        width,
        height,
        frames,
        per_frame_budget: budget,
    };
    if plan.total_pixels() > constraints.total_pixels {
        return Err(VideoError::PixelBudget(format!(
            "{} frames at {}x{} exceed total_pixels {} (min_pixels {} forces a larger frame)",
            frames, width, height, constraints.total_pixels, constraints.min_pixels
        )));
    }

    tracing::debug!(
        native = %format!("{}x{}", native_width, native_height),
        target = %format!("{}x{}", width, height),
        frames,
        budget,
        "resolution planned"
    );
    Ok(plan)
}
