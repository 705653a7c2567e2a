//! Readiness check for the motion executor on the consumer side.
//!
//! The consumer may only ask for (or run) a new command when the executor
//! reports idle. Between checks it sleeps for a delay that doubles while
//! nothing happens and snaps back to the minimum when work shows up.

use std::time::Duration;

/// Snapshot of the toolhead planner, in firmware print-time units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolheadStatus {
    pub print_time: f64,
    pub est_print_time: f64,
    pub lookahead_empty: bool,
}

impl ToolheadStatus {
    /// How far the estimated print time runs ahead of the planned print time
    pub fn idle_margin(&self) -> f64 {
        self.est_print_time - self.print_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusyGate {
    idle_threshold: f64,
}

impl Default for BusyGate {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl BusyGate {
    pub fn new(idle_threshold: f64) -> Self {
        Self { idle_threshold }
    }

    pub fn idle_threshold(&self) -> f64 {
        self.idle_threshold
    }

    /// Busy unless the lookahead queue is empty and the idle margin exceeds
    /// the threshold.
    pub fn is_busy(&self, status: &ToolheadStatus) -> bool {
        !(status.lookahead_empty && status.idle_margin() > self.idle_threshold)
    }
}

/// Exponential poll back-off between `min` and `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl PollBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Nothing to do this tick: return the current delay and double the next.
    pub fn idle(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Work pending or just executed: poll again quickly.
    pub fn active(&mut self) -> Duration {
        self.current = self.min;
        self.min
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(20), Duration::from_millis(200))
    }
}

/// The firmware side that actually moves the stage.
///
/// `now` is the executor's monotonic clock in seconds.
pub trait MotionExecutor {
    fn status(&self, now: f64) -> ToolheadStatus;

    /// Queue a G-code script for execution.
    fn run_script(&mut self, script: &str, now: f64) -> Result<(), String>;
}
