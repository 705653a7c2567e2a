//! Bang-bang feedback law mapping a marker position to a stage command.
//!
//! Direction is coarse: the controller only ever picks one of four moves or
//! [`Command::Centered`]. The proportional part of the loop lives in the
//! step *magnitude* returned by [`FeedbackController::multiplier`], which
//! grows with the distance to the region center and shrinks as the marker
//! gets larger (closer) in the image.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::gcode::Axis;
use crate::observation::MarkerObservation;
use crate::region::AcceptanceRegion;

/// Discrete stage command derived from one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
pub enum Command {
    /// Marker above the region
    Up,
    /// Marker below the region
    Down,
    /// Marker left of the region
    Left,
    /// Marker right of the region
    Right,
    /// Marker inside the region, no motion
    Centered,
}

impl Command {
    /// Axis and unit sign of the move this command requests.
    ///
    /// `Up` maps to `+Y`: a marker above the acceptance region is brought down
    /// in the image by advancing the mount along +Y.
    pub fn axis_sign(self) -> Option<(Axis, f64)> {
        match self {
            Command::Up => Some((Axis::Y, 1.0)),
            Command::Down => Some((Axis::Y, -1.0)),
            Command::Right => Some((Axis::X, 1.0)),
            Command::Left => Some((Axis::X, -1.0)),
            Command::Centered => None,
        }
    }

    pub fn is_centered(self) -> bool {
        self == Command::Centered
    }
}

/// Pixel distance from the marker center to the nearest region edge, per axis.
///
/// Zero on an axis where the marker lies within the region bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Overshoot {
    pub vertical: f64,
    pub vertical_command: Option<Command>,
    pub horizontal: f64,
    pub horizontal_command: Option<Command>,
}

impl Overshoot {
    pub fn measure(x: f64, y: f64, region: &AcceptanceRegion) -> Self {
        let (top, bottom) = (region.top as f64, region.bottom as f64);
        let (left, right) = (region.left as f64, region.right as f64);

        let (vertical, vertical_command) = if y < top {
            (top - y, Some(Command::Up))
        } else if y > bottom {
            (y - bottom, Some(Command::Down))
        } else {
            (0.0, None)
        };

        let (horizontal, horizontal_command) = if x < left {
            (left - x, Some(Command::Left))
        } else if x > right {
            (x - right, Some(Command::Right))
        } else {
            (0.0, None)
        };

        Self {
            vertical,
            vertical_command,
            horizontal,
            horizontal_command,
        }
    }

    /// Resolve to a single command, preferring the axis with the larger overshoot.
    ///
    /// Ties go to the vertical axis.
    pub fn command(&self) -> Command {
        if self.vertical == 0.0 && self.horizontal == 0.0 {
            return Command::Centered;
        }
        if self.vertical >= self.horizontal {
            if let Some(command) = self.vertical_command {
                return command;
            }
        }
        self.horizontal_command
            .or(self.vertical_command)
            .unwrap_or(Command::Centered)
    }
}

/// Command plus step magnitude for one observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub command: Command,
    pub multiplier: f64,
}

/// Distance band edges in pixels and the scale used outside them.
const FAR_DISTANCE_PX: f64 = 250.0;
const NEAR_DISTANCE_PX: f64 = 50.0;
const FAR_SCALE: f64 = 5.0;
const NEAR_SCALE: f64 = 0.1;

/// Marker edge length in pixels at which the size term vanishes.
const REFERENCE_MARKER_SIZE_PX: f64 = 200.0;

/// Tuning for [`FeedbackController`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Weight of the distance-to-center term
    pub dist_weight: f64,
    /// Weight of the apparent marker size term
    pub size_weight: f64,
    /// Smallest step multiplier ever commanded
    pub min_multiplier: f64,
    /// Corner indices whose separation defines the marker size
    pub size_corners: (usize, usize),
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            dist_weight: 0.8,
            size_weight: 0.2,
            min_multiplier: 0.5,
            size_corners: (0, 1),
        }
    }
}

/// Maps observations to commands and step multipliers.
#[derive(Debug, Clone, Default)]
pub struct FeedbackController {
    config: FeedbackConfig,
}

impl FeedbackController {
    /// # Panics
    /// Panics if a size corner index is outside `0..4`.
    pub fn new(config: FeedbackConfig) -> Self {
        let (a, b) = config.size_corners;
        assert!(a < 4 && b < 4, "size corner indices must be in 0..4");
        Self { config }
    }

    pub fn config(&self) -> &FeedbackConfig {
        &self.config
    }

    /// Direction the stage should move to bring the marker into the region.
    pub fn determine(&self, observation: &MarkerObservation, region: &AcceptanceRegion) -> Command {
        Overshoot::measure(observation.center.x, observation.center.y, region).command()
    }

    /// Step magnitude for the observation, never below `min_multiplier`.
    pub fn multiplier(&self, observation: &MarkerObservation, region: &AcceptanceRegion) -> f64 {
        let (cx, cy) = region.center();
        let dx = observation.center.x - cx;
        let dy = observation.center.y - cy;
        let distance = (dx * dx + dy * dy).sqrt();

        let (a, b) = self.config.size_corners;
        let marker_size = observation.corner_distance(a, b);

        let multiplier = distance_scale(distance) * self.config.dist_weight
            + (1.0 - marker_size / REFERENCE_MARKER_SIZE_PX) * self.config.size_weight;
        multiplier.max(self.config.min_multiplier)
    }

    pub fn evaluate(&self, observation: &MarkerObservation, region: &AcceptanceRegion) -> Correction {
        Correction {
            command: self.determine(observation, region),
            multiplier: self.multiplier(observation, region),
        }
    }
}

/// Piecewise distance scale: flat far and near, linear in between.
pub fn distance_scale(distance_px: f64) -> f64 {
    if distance_px > FAR_DISTANCE_PX {
        FAR_SCALE
    } else if distance_px < NEAR_DISTANCE_PX {
        NEAR_SCALE
    } else {
        distance_px / NEAR_DISTANCE_PX
    }
}
