//! Tunable parameters for an auto-calibration run.
//!
//! Everything here has a working default; a JSON file only needs the fields it
//! overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::feedback::FeedbackConfig;
use crate::region::TargetScale;
use crate::stage::StageHeights;

/// Default Moonraker WebSocket endpoint of the bench printer
pub const DEFAULT_MOONRAKER_URL: &str = "ws://192.168.0.100:7125/websocket";

/// Default path of the datagram socket the firmware consumer binds
pub const DEFAULT_COMMAND_SOCKET: &str = "/tmp/command_socket.sock";

/// Default path of the stream socket the controller binds
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/control_socket.sock";

/// Top-level calibration configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Initial acceptance window as a fraction of the frame's shorter side
    pub target_scale: f64,
    pub min_scale: f64,
    pub max_scale: f64,
    /// Fractional change applied by manual grow/shrink requests
    pub scale_step_fraction: f64,
    /// Consecutive centered commands needed to advance a stage
    pub centered_threshold: u32,
    /// Axis travel for a move with multiplier 1.0
    pub base_distance: f64,
    /// Pause after each emitted tracking move, in milliseconds
    pub settle_delay_ms: u64,
    pub feedback: FeedbackConfig,
    pub stage_heights: StageHeights,
    pub moonraker: MoonrakerSettings,
    pub workcell: WorkcellSettings,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            target_scale: 0.1,
            min_scale: 0.05,
            max_scale: 0.9,
            scale_step_fraction: 0.05,
            centered_threshold: 5,
            base_distance: 1.0,
            settle_delay_ms: 100,
            feedback: FeedbackConfig::default(),
            stage_heights: StageHeights::default(),
            moonraker: MoonrakerSettings::default(),
            workcell: WorkcellSettings::default(),
        }
    }
}

impl CalibrationConfig {
    /// Initial target scale clamped to the configured bounds
    pub fn target_scale(&self) -> TargetScale {
        TargetScale::new(self.target_scale, self.min_scale, self.max_scale)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from JSON file. The result has passed [`validate`](Self::validate).
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the controller cannot run with.
    ///
    /// Errors are [`InvalidData`](std::io::ErrorKind::InvalidData), like a
    /// malformed file.
    pub fn validate(&self) -> Result<(), std::io::Error> {
        let invalid = |msg: String| Err(std::io::Error::new(std::io::ErrorKind::InvalidData, msg));

        let bounded = self.min_scale.is_finite() && self.max_scale.is_finite();
        if !bounded || self.min_scale > self.max_scale {
            return invalid(format!(
                "scale bounds [{}, {}] must be finite with min <= max",
                self.min_scale, self.max_scale
            ));
        }
        if !self.target_scale.is_finite() {
            return invalid(format!("target_scale {} is not finite", self.target_scale));
        }
        if !(0.0..1.0).contains(&self.scale_step_fraction) {
            return invalid(format!(
                "scale_step_fraction {} must be in [0, 1)",
                self.scale_step_fraction
            ));
        }
        if self.centered_threshold == 0 {
            return invalid("centered_threshold must be at least 1".to_string());
        }
        if !(self.base_distance.is_finite() && self.base_distance > 0.0) {
            return invalid(format!("base_distance {} must be positive", self.base_distance));
        }
        let (a, b) = self.feedback.size_corners;
        if a >= 4 || b >= 4 {
            return invalid(format!("size_corners ({a}, {b}) must index corners 0..4"));
        }
        if self.moonraker.response_timeout_ms == Some(0) {
            return invalid(
                "moonraker.response_timeout_ms must be non-zero; omit it to wait indefinitely"
                    .to_string(),
            );
        }
        if !self.workcell.busy_threshold.is_finite() {
            return invalid(format!(
                "workcell.busy_threshold {} is not finite",
                self.workcell.busy_threshold
            ));
        }
        if self.workcell.poll_min_ms > self.workcell.poll_max_ms {
            return invalid(format!(
                "workcell poll interval [{}, {}] ms has min > max",
                self.workcell.poll_min_ms, self.workcell.poll_max_ms
            ));
        }
        Ok(())
    }
}

/// Connection settings for the Moonraker JSON-RPC backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoonrakerSettings {
    pub url: String,
    /// Response timeout in milliseconds; `None` waits indefinitely
    pub response_timeout_ms: Option<u64>,
}

impl Default for MoonrakerSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_MOONRAKER_URL.to_string(),
            response_timeout_ms: Some(120_000),
        }
    }
}

impl MoonrakerSettings {
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }
}

/// Socket paths and pacing for the workcell IPC backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkcellSettings {
    pub command_socket: PathBuf,
    pub control_socket: PathBuf,
    /// How long to wait for the consumer's `START`; `None` waits indefinitely
    pub start_timeout_ms: Option<u64>,
    /// How long to wait for a `REQUEST` before a send fails; `None` waits indefinitely
    pub request_timeout_ms: Option<u64>,
    /// Idle margin (firmware time units) the toolhead needs before it counts as idle
    pub busy_threshold: f64,
    pub poll_min_ms: u64,
    pub poll_max_ms: u64,
}

impl Default for WorkcellSettings {
    fn default() -> Self {
        Self {
            command_socket: PathBuf::from(DEFAULT_COMMAND_SOCKET),
            control_socket: PathBuf::from(DEFAULT_CONTROL_SOCKET),
            start_timeout_ms: None,
            request_timeout_ms: None,
            busy_threshold: 0.05,
            poll_min_ms: 20,
            poll_max_ms: 200,
        }
    }
}

impl WorkcellSettings {
    pub fn start_timeout(&self) -> Option<Duration> {
        self.start_timeout_ms.map(Duration::from_millis)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_min(&self) -> Duration {
        Duration::from_millis(self.poll_min_ms)
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms)
    }
}
