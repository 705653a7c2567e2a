//! Auto-calibration control loop for the marker centering stage.
//!
//! Ties detections from an external detector to a [`hardware::CommandChannel`]
//! and walks the stage through the calibration heights until the marker
//! holds centered at the final one.

pub mod calibrate;
#[cfg(feature = "workcell")]
pub mod sim;
pub mod source;

pub use calibrate::{CalibrationRun, Calibrator, RunError, RunReport, StopReason};
pub use source::{FrameSource, JsonLinesSource, ScriptedSource, SourceError, SourceEvent};
