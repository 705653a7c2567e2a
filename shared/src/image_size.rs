//! Frame dimensions and size utilities

use serde::{Deserialize, Serialize};

/// Frame dimensions structure
///
/// Represents the width and height of a captured camera frame in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    /// Frame width in pixels
    pub width: usize,
    /// Frame height in pixels
    pub height: usize,
}

impl ImageSize {
    /// Create a new ImageSize
    pub fn from_width_height(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Length of the shorter side, used to size square windows on the frame
    pub fn min_dimension(&self) -> usize {
        self.width.min(self.height)
    }

    /// Integer pixel center of the frame `(width / 2, height / 2)`
    pub fn center(&self) -> (i64, i64) {
        ((self.width / 2) as i64, (self.height / 2) as i64)
    }
}
