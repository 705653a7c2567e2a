//! Acceptance region geometry.
//!
//! The acceptance region is the square pixel window, centered on the frame,
//! inside which a marker counts as centered. Its side is a fraction
//! (`target_scale`) of the frame's shorter dimension, so tightening the scale
//! tightens the convergence criterion without touching the controller.
//!
//! ```text
//!         left        right
//!   top    +-----------+
//!          |     +     |     + = (center_x, center_y)
//! bottom   +-----------+
//! ```

use serde::{Deserialize, Serialize};

use crate::image_size::ImageSize;

/// Axis-aligned centered window in integer pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceRegion {
    pub top: i64,
    pub bottom: i64,
    pub left: i64,
    pub right: i64,
    pub center_x: i64,
    pub center_y: i64,
}

impl AcceptanceRegion {
    /// Compute the region for a frame of `size` at the given `target_scale`.
    ///
    /// The side is `max(1, floor(min(width, height) * target_scale))`; the
    /// square is centered on the integer frame center and clipped to the
    /// frame bounds.
    pub fn from_frame(size: ImageSize, target_scale: f64) -> Self {
        let side = ((size.min_dimension() as f64 * target_scale).floor() as i64).max(1);
        let half_side = side / 2;
        let (center_x, center_y) = size.center();
        let width = size.width as i64;
        let height = size.height as i64;

        Self {
            top: (center_y - half_side).max(0),
            bottom: (center_y + half_side).min(height),
            left: (center_x - half_side).max(0),
            right: (center_x + half_side).min(width),
            center_x,
            center_y,
        }
    }

    /// Region width in pixels
    pub fn width(&self) -> i64 {
        self.right - self.left
    }

    /// Region height in pixels
    pub fn height(&self) -> i64 {
        self.bottom - self.top
    }

    /// Region center as floating point pixel coordinates
    pub fn center(&self) -> (f64, f64) {
        (self.center_x as f64, self.center_y as f64)
    }

    /// True when `(x, y)` lies inside the region, bounds inclusive.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.left as f64
            && x <= self.right as f64
            && y >= self.top as f64
            && y <= self.bottom as f64
    }
}

/// Acceptance-window scale with its bounds.
///
/// Every mutation clamps to `[min, max]`, so `min <= value <= max` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetScale {
    value: f64,
    min: f64,
    max: f64,
}

impl TargetScale {
    /// Create a scale, clamping `value` into `[min, max]`.
    ///
    /// # Panics
    /// Panics if `min > max` or either bound is not finite.
    pub fn new(value: f64, min: f64, max: f64) -> Self {
        assert!(
            min.is_finite() && max.is_finite() && min <= max,
            "invalid target scale bounds [{min}, {max}]"
        );
        Self {
            value: value.clamp(min, max),
            min,
            max,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Halve the scale, bounded below by `min`. Applied on calibration stage entry.
    pub fn halve(&mut self) -> f64 {
        self.value = (self.value * 0.5).max(self.min);
        self.value
    }

    /// Widen the window by `step_fraction` of its current size.
    pub fn grow(&mut self, step_fraction: f64) -> f64 {
        self.value = (self.value * (1.0 + step_fraction)).min(self.max);
        self.value
    }

    /// Narrow the window by `step_fraction` of its current size.
    pub fn shrink(&mut self, step_fraction: f64) -> f64 {
        self.value = (self.value * (1.0 - step_fraction)).max(self.min);
        self.value
    }

    /// Region for a frame of `size` at the current scale.
    pub fn region(&self, size: ImageSize) -> AcceptanceRegion {
        AcceptanceRegion::from_frame(size, self.value)
    }
}
