//! Calibration stage bookkeeping.
//!
//! The [`Calibrator`] is a pure state machine: it is fed the command chosen
//! for each observation and reports when a stage boundary is crossed. Motion
//! for the boundary comes from [`stage_entry`], which the control loop sends.

use shared::calibration_config::CalibrationConfig;
use shared::feedback::Command;
use shared::gcode::{CommandAssembler, MotionProgram};
use shared::image_size::ImageSize;
use shared::region::{AcceptanceRegion, TargetScale};
use shared::stage::CalibrationStage;

/// Mutable state of one calibration run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSession {
    pub stage: CalibrationStage,
    pub consecutive_centered: u32,
    pub target_scale: TargetScale,
    pub completed: bool,
}

impl CalibrationSession {
    pub fn new(target_scale: TargetScale) -> Self {
        Self {
            stage: CalibrationStage::FIRST,
            consecutive_centered: 0,
            target_scale,
            completed: false,
        }
    }
}

/// Drives a [`CalibrationSession`] through `S1 -> S2 -> S3 -> Calibrated`.
#[derive(Debug, Clone)]
pub struct Calibrator {
    session: CalibrationSession,
    initial_scale: TargetScale,
    centered_threshold: u32,
    scale_step_fraction: f64,
}

impl Calibrator {
    /// # Panics
    /// Panics if `centered_threshold` is zero.
    pub fn new(target_scale: TargetScale, centered_threshold: u32, scale_step_fraction: f64) -> Self {
        assert!(centered_threshold > 0, "centered threshold must be at least 1");
        Self {
            session: CalibrationSession::new(target_scale),
            initial_scale: target_scale,
            centered_threshold,
            scale_step_fraction,
        }
    }

    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self::new(
            config.target_scale(),
            config.centered_threshold,
            config.scale_step_fraction,
        )
    }

    pub fn session(&self) -> &CalibrationSession {
        &self.session
    }

    pub fn stage(&self) -> CalibrationStage {
        self.session.stage
    }

    pub fn is_completed(&self) -> bool {
        self.session.completed
    }

    pub fn target_scale(&self) -> f64 {
        self.session.target_scale.value()
    }

    pub fn centered_threshold(&self) -> u32 {
        self.centered_threshold
    }

    /// Acceptance region for a frame at the current scale.
    pub fn region(&self, size: ImageSize) -> AcceptanceRegion {
        self.session.target_scale.region(size)
    }

    /// Count one command toward stage completion.
    ///
    /// Returns the stage just entered, if this command completed one.
    pub fn record(&mut self, command: Command) -> Option<CalibrationStage> {
        if self.session.completed {
            return None;
        }

        if !command.is_centered() {
            self.session.consecutive_centered = 0;
            return None;
        }

        self.session.consecutive_centered += 1;
        if self.session.consecutive_centered < self.centered_threshold {
            return None;
        }

        let next = self.session.stage.next()?;
        self.session.stage = next;
        self.session.consecutive_centered = 0;

        if next.is_terminal() {
            self.session.completed = true;
        } else if !next.is_first() {
            self.session.target_scale.halve();
        }

        Some(next)
    }

    /// Widen the acceptance window by one manual step.
    pub fn grow_region(&mut self) -> f64 {
        self.session.target_scale.grow(self.scale_step_fraction)
    }

    /// Narrow the acceptance window by one manual step.
    pub fn shrink_region(&mut self) -> f64 {
        self.session.target_scale.shrink(self.scale_step_fraction)
    }

    /// Start over from the first stage at the initial scale.
    pub fn reset(&mut self) {
        self.session = CalibrationSession::new(self.initial_scale);
    }
}

/// Motion sent on entry to a non-terminal stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageEntry {
    /// Absolute mode and the approach height; must finish before tracking resumes
    pub approach: MotionProgram,
    /// Back to relative mode for tracking moves
    pub resume: MotionProgram,
}

/// Entry motion for `stage`, or `None` for the terminal stage.
pub fn stage_entry(assembler: &mut CommandAssembler, stage: CalibrationStage) -> Option<StageEntry> {
    if stage.is_terminal() {
        return None;
    }

    let approach = MotionProgram::from(vec![assembler.set_absolute(), assembler.set_height(stage)]);
    let resume = MotionProgram::from(assembler.set_relative());
    Some(StageEntry { approach, resume })
}
