//! Calibration stages and their approach heights.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

/// One pass of the multi-stage convergence procedure.
///
/// Stages are ordered; each non-terminal stage runs the tracking loop at a
/// fixed approach height, lower (closer to the marker) than the last.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter, Serialize, Deserialize,
)]
pub enum CalibrationStage {
    S1,
    S2,
    S3,
    Calibrated,
}

impl CalibrationStage {
    /// Stage a fresh session starts in
    pub const FIRST: CalibrationStage = CalibrationStage::S1;

    /// Next stage in order, `None` once calibrated.
    pub fn next(self) -> Option<CalibrationStage> {
        match self {
            CalibrationStage::S1 => Some(CalibrationStage::S2),
            CalibrationStage::S2 => Some(CalibrationStage::S3),
            CalibrationStage::S3 => Some(CalibrationStage::Calibrated),
            CalibrationStage::Calibrated => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == CalibrationStage::Calibrated
    }

    pub fn is_first(self) -> bool {
        self == Self::FIRST
    }
}

/// Approach height (Z) commanded on entry to each stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageHeights {
    pub s1: f64,
    pub s2: f64,
    pub s3: f64,
    pub calibrated: f64,
}

impl StageHeights {
    pub fn height(&self, stage: CalibrationStage) -> f64 {
        match stage {
            CalibrationStage::S1 => self.s1,
            CalibrationStage::S2 => self.s2,
            CalibrationStage::S3 => self.s3,
            CalibrationStage::Calibrated => self.calibrated,
        }
    }
}

impl Default for StageHeights {
    fn default() -> Self {
        Self {
            s1: 175.0,
            s2: 100.0,
            s3: 25.0,
            calibrated: 0.0,
        }
    }
}
