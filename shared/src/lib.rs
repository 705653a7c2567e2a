//! Shared components for the marker centering workcell.
//!
//! Pure types and algorithms with no I/O beyond configuration files: frame
//! geometry, marker observations, the acceptance region, the feedback law,
//! G-code assembly and calibration stages. Drivers live in `hardware`, the
//! control loop in `test-bench`.

pub mod calibration_config;
pub mod config_storage;
pub mod feedback;
pub mod gcode;
pub mod image_size;
pub mod observation;
pub mod region;
pub mod stage;

pub use calibration_config::CalibrationConfig;
pub use feedback::{Command, Correction, FeedbackConfig, FeedbackController};
pub use gcode::{Axis, CommandAssembler, HeightTarget, MotionPrimitive, MotionProgram};
pub use image_size::ImageSize;
pub use observation::{FrameDetections, MarkerObservation};
pub use region::{AcceptanceRegion, TargetScale};
pub use stage::{CalibrationStage, StageHeights};
