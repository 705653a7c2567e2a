//! Marker observations produced by an external fiducial detector.
//!
//! The detector runs in its own process and sees no motor state; it publishes
//! one [`FrameDetections`] per captured frame. These types are the only
//! information the control loop receives about the world.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::image_size::ImageSize;

/// One detected fiducial marker in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerObservation {
    /// Decoded marker identifier
    pub marker_id: u32,
    /// Marker center in pixels
    pub center: Point2<f64>,
    /// Marker corners in detector order (the same winding for every detection)
    pub corners: [Point2<f64>; 4],
}

impl MarkerObservation {
    pub fn new(marker_id: u32, center: Point2<f64>, corners: [Point2<f64>; 4]) -> Self {
        Self {
            marker_id,
            center,
            corners,
        }
    }

    /// Axis-aligned square marker of side `side` centered at `(x, y)`.
    ///
    /// Corners run top-left, top-right, bottom-right, bottom-left.
    pub fn square(marker_id: u32, x: f64, y: f64, side: f64) -> Self {
        let h = side / 2.0;
        Self::new(
            marker_id,
            Point2::new(x, y),
            [
                Point2::new(x - h, y - h),
                Point2::new(x + h, y - h),
                Point2::new(x + h, y + h),
                Point2::new(x - h, y + h),
            ],
        )
    }

    /// Distance in pixels between two corners.
    ///
    /// # Panics
    /// Panics if either index is not in `0..4`.
    pub fn corner_distance(&self, a: usize, b: usize) -> f64 {
        nalgebra::distance(&self.corners[a], &self.corners[b])
    }
}

/// All markers reported by the detector for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDetections {
    /// Dimensions of the frame the detections came from
    pub size: ImageSize,
    /// Markers in detector-report order
    #[serde(default)]
    pub markers: Vec<MarkerObservation>,
}

impl FrameDetections {
    pub fn new(size: ImageSize, markers: Vec<MarkerObservation>) -> Self {
        Self { size, markers }
    }

    /// A frame with no markers in view
    pub fn empty(size: ImageSize) -> Self {
        Self::new(size, Vec::new())
    }

    /// First reported marker, or `None` when nothing was detected.
    pub fn primary(&self) -> Option<&MarkerObservation> {
        self.markers.first()
    }

    /// Markers in the order the detector reported them.
    pub fn observations(&self) -> impl Iterator<Item = &MarkerObservation> {
        self.markers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}
