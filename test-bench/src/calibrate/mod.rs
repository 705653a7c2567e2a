//! Auto-calibration: stage bookkeeping and the closed control loop.

mod run;
mod session;

pub use run::{CalibrationRun, RunError, RunReport, StopReason};
pub use session::{stage_entry, CalibrationSession, Calibrator, StageEntry};
