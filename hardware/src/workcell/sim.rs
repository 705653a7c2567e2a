//! Simulated toolhead for bench runs without a printer.
//!
//! Moves take `distance / feed_rate` seconds and queue back to back, which is
//! enough to exercise the busy gate the same way a real planner does.

use shared::gcode::{Axis, MotionPrimitive};
use tracing::trace;

use super::busy_gate::{MotionExecutor, ToolheadStatus};

/// Barrier command; the simulator executes moves in order anyway.
const WAIT_FOR_MOVES: &str = "M400";

#[derive(Debug, Clone)]
pub struct SimulatedToolhead {
    feed_rate: f64,
    position: [f64; 3],
    relative: bool,
    homed: bool,
    busy_until: f64,
    history: Vec<MotionPrimitive>,
}

impl Default for SimulatedToolhead {
    fn default() -> Self {
        Self::new(50.0)
    }
}

impl SimulatedToolhead {
    /// Toolhead at the origin, absolute mode, moving at `feed_rate` units/s.
    pub fn new(feed_rate: f64) -> Self {
        assert!(feed_rate > 0.0, "feed rate must be positive");
        Self {
            feed_rate,
            position: [0.0; 3],
            relative: false,
            homed: false,
            busy_until: 0.0,
            history: Vec::new(),
        }
    }

    pub fn position(&self) -> [f64; 3] {
        self.position
    }

    pub fn axis_position(&self, axis: Axis) -> f64 {
        self.position[axis_index(axis)]
    }

    pub fn is_relative(&self) -> bool {
        self.relative
    }

    pub fn is_homed(&self) -> bool {
        self.homed
    }

    /// Time at which the last queued move finishes
    pub fn busy_until(&self) -> f64 {
        self.busy_until
    }

    /// Every primitive executed so far
    pub fn history(&self) -> &[MotionPrimitive] {
        &self.history
    }

    /// Apply one primitive starting no earlier than `now`.
    pub fn apply(&mut self, primitive: MotionPrimitive, now: f64) {
        let start = self.busy_until.max(now);
        let travel = match primitive {
            MotionPrimitive::SetAbsolute => {
                self.relative = false;
                0.0
            }
            MotionPrimitive::SetRelative => {
                self.relative = true;
                0.0
            }
            MotionPrimitive::Home => {
                let travel = self.position.iter().map(|p| p.abs()).fold(0.0, f64::max);
                self.position = [0.0; 3];
                self.homed = true;
                travel
            }
            MotionPrimitive::Move { axis, distance } => self.move_axis(axis, distance),
            MotionPrimitive::SetHeight(z) => self.move_axis(Axis::Z, z),
        };

        self.busy_until = start + travel / self.feed_rate;
        self.history.push(primitive);
        trace!("sim toolhead {primitive} -> {:?}", self.position);
    }

    fn move_axis(&mut self, axis: Axis, value: f64) -> f64 {
        let slot = &mut self.position[axis_index(axis)];
        let target = if self.relative { *slot + value } else { value };
        let travel = (target - *slot).abs();
        *slot = target;
        travel
    }
}

fn axis_index(axis: Axis) -> usize {
    match axis {
        Axis::X => 0,
        Axis::Y => 1,
        Axis::Z => 2,
    }
}

impl MotionExecutor for SimulatedToolhead {
    fn status(&self, now: f64) -> ToolheadStatus {
        ToolheadStatus {
            print_time: self.busy_until,
            est_print_time: now,
            lookahead_empty: now >= self.busy_until,
        }
    }

    /// Parses and applies every line; nothing is applied if any line is invalid.
    fn run_script(&mut self, script: &str, now: f64) -> Result<(), String> {
        let primitives = script
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.eq_ignore_ascii_case(WAIT_FOR_MOVES))
            .map(|line| {
                line.parse::<MotionPrimitive>()
                    .map_err(|e| format!("{line:?}: {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        for primitive in primitives {
            self.apply(primitive, now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workcell::busy_gate::BusyGate;
    use approx::assert_relative_eq;

    #[test]
    fn test_relative_and_absolute_moves() {
        let mut head = SimulatedToolhead::new(10.0);
        head.run_script("G90\nG1 Z100", 0.0).unwrap();
        assert_relative_eq!(head.axis_position(Axis::Z), 100.0);

        head.run_script("G91\nG1 X2.5\nG1 X-1", 0.0).unwrap();
        assert_relative_eq!(head.axis_position(Axis::X), 1.5);
        assert!(head.is_relative());

        head.run_script("G28", 0.0).unwrap();
        assert_eq!(head.position(), [0.0; 3]);
        assert!(head.is_homed());
    }

    #[test]
    fn test_moves_keep_toolhead_busy() {
        let gate = BusyGate::default();
        let mut head = SimulatedToolhead::new(10.0);
        assert!(!gate.is_busy(&head.status(1.0)));

        head.run_script("G91\nG1 Y5", 1.0).unwrap();
        assert_relative_eq!(head.busy_until(), 1.5);
        assert!(gate.is_busy(&head.status(1.2)));
        // Idle margin must exceed the threshold after the move ends
        assert!(gate.is_busy(&head.status(1.52)));
        assert!(!gate.is_busy(&head.status(1.6)));
    }

    #[test]
    fn test_moves_queue_back_to_back() {
        let mut head = SimulatedToolhead::new(1.0);
        head.run_script("G91\nG1 X1", 0.0).unwrap();
        head.run_script("G1 X1", 0.5).unwrap();
        assert_relative_eq!(head.busy_until(), 2.0);
    }

    #[test]
    fn test_barrier_and_invalid_lines() {
        let mut head = SimulatedToolhead::default();
        head.run_script("G90\nG1 Z25\nM400", 0.0).unwrap();
        assert_eq!(head.history().len(), 2);

        let err = head.run_script("G91\nM106 S255", 0.0).unwrap_err();
        assert!(err.contains("M106"));
        // Rejected script leaves the toolhead untouched
        assert!(!head.is_relative());
        assert_eq!(head.history().len(), 2);
    }
}
