//! Simulated stage and camera for running the loop without hardware.
//!
//! Both halves share one [`SimulatedToolhead`]: motion sent through
//! [`SimulatedStage`] moves the camera that [`SimulatedCamera`] renders
//! detections from.

use std::cell::RefCell;
use std::rc::Rc;

use hardware::workcell::SimulatedToolhead;
use hardware::{ChannelError, ChannelResult, CommandChannel, Completion, ConnectionState};
use serde::{Deserialize, Serialize};
use shared::gcode::{Axis, MotionPrimitive, MotionProgram};
use shared::image_size::ImageSize;
use shared::observation::{FrameDetections, MarkerObservation};
use tracing::debug;

use crate::source::{FrameSource, SourceError, SourceEvent};

pub type SharedToolhead = Rc<RefCell<SimulatedToolhead>>;

/// Pinhole-ish camera carried by the stage, looking down at one marker.
///
/// Apparent scale in pixels per mm is `focal / (z + z_offset)`. Moving the
/// stage along +X shifts the marker left in the image; +Y shifts it down.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub frame: ImageSize,
    pub focal: f64,
    pub z_offset: f64,
    pub marker_id: u32,
    /// Marker position on the bed in stage coordinates (mm)
    pub marker_position: (f64, f64),
    /// Marker edge length (mm)
    pub marker_side: f64,
}

impl Default for CameraModel {
    fn default() -> Self {
        Self {
            frame: ImageSize::from_width_height(640, 480),
            focal: 2000.0,
            z_offset: 25.0,
            marker_id: 7,
            marker_position: (3.0, -2.0),
            marker_side: 10.0,
        }
    }
}

impl CameraModel {
    pub fn pixels_per_mm(&self, z: f64) -> f64 {
        self.focal / (z + self.z_offset).max(f64::EPSILON)
    }

    /// Detections for a stage at `position`; empty when the marker is out of frame.
    pub fn render(&self, position: [f64; 3]) -> FrameDetections {
        let [sx, sy, z] = position;
        let scale = self.pixels_per_mm(z);
        let (cx, cy) = self.frame.center();
        let (mx, my) = self.marker_position;

        let x = cx as f64 + (mx - sx) * scale;
        let y = cy as f64 + (sy - my) * scale;

        let in_frame =
            (0.0..self.frame.width as f64).contains(&x) && (0.0..self.frame.height as f64).contains(&y);
        if !in_frame {
            return FrameDetections::empty(self.frame);
        }

        FrameDetections::new(
            self.frame,
            vec![MarkerObservation::square(
                self.marker_id,
                x,
                y,
                self.marker_side * scale,
            )],
        )
    }
}

/// [`CommandChannel`] that applies programs to a shared simulated toolhead.
///
/// Motion completes instantly, so both completion modes behave the same.
pub struct SimulatedStage {
    toolhead: SharedToolhead,
    connected: bool,
    refuse_connect: bool,
    fail_every: Option<usize>,
    moves: usize,
    requested_marker: Option<u32>,
}

impl SimulatedStage {
    pub fn new(toolhead: SharedToolhead) -> Self {
        Self {
            toolhead,
            connected: false,
            refuse_connect: false,
            fail_every: None,
            moves: 0,
            requested_marker: None,
        }
    }

    /// Make every `connect` fail.
    pub fn refusing_connections(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Reject every `n`th acknowledged axis move with a remote error.
    pub fn failing_every(mut self, n: usize) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    /// Report `marker_id` as the marker the stage side asked for.
    pub fn requesting(mut self, marker_id: u32) -> Self {
        self.requested_marker = Some(marker_id);
        self
    }

    pub fn toolhead(&self) -> &SharedToolhead {
        &self.toolhead
    }
}

impl CommandChannel for SimulatedStage {
    fn connect(&mut self) -> ChannelResult<()> {
        if self.refuse_connect {
            return Err(ChannelError::ConnectionFailed(
                "simulated stage refused the connection".to_string(),
            ));
        }
        self.connected = true;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if self.connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn send_program(&mut self, program: &MotionProgram, completion: Completion) -> ChannelResult<()> {
        if !self.connected {
            return Err(ChannelError::NotConnected);
        }
        if program.is_empty() {
            return Ok(());
        }

        let has_move = program
            .primitives()
            .iter()
            .any(|p| matches!(p, MotionPrimitive::Move { .. }));
        if has_move && completion == Completion::Acknowledged {
            self.moves += 1;
            if self.fail_every.is_some_and(|n| self.moves % n == 0) {
                return Err(ChannelError::Remote {
                    code: Some(400),
                    message: "simulated rejection".to_string(),
                });
            }
        }

        let mut toolhead = self.toolhead.borrow_mut();
        for &primitive in program.primitives() {
            toolhead.apply(primitive, 0.0);
        }
        debug!(
            "sim stage at ({:.2}, {:.2}, {:.2})",
            toolhead.axis_position(Axis::X),
            toolhead.axis_position(Axis::Y),
            toolhead.axis_position(Axis::Z)
        );
        Ok(())
    }

    fn disconnect(&mut self) -> ChannelResult<()> {
        self.connected = false;
        Ok(())
    }

    fn requested_marker(&self) -> Option<u32> {
        self.requested_marker
    }
}

/// [`FrameSource`] that renders the marker from the shared toolhead position.
pub struct SimulatedCamera {
    toolhead: SharedToolhead,
    model: CameraModel,
    max_frames: usize,
    frames: usize,
}

impl SimulatedCamera {
    /// Camera that stops after `max_frames` frames.
    pub fn new(toolhead: SharedToolhead, model: CameraModel, max_frames: usize) -> Self {
        Self {
            toolhead,
            model,
            max_frames,
            frames: 0,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }
}

impl FrameSource for SimulatedCamera {
    fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        if self.frames >= self.max_frames {
            return Ok(None);
        }
        self.frames += 1;
        let position = self.toolhead.borrow().position();
        Ok(Some(SourceEvent::Frame(self.model.render(position))))
    }
}

/// A stage and camera sharing a fresh toolhead.
pub fn bench(
    feed_rate: f64,
    model: CameraModel,
    max_frames: usize,
) -> (SimulatedStage, SimulatedCamera) {
    let toolhead = Rc::new(RefCell::new(SimulatedToolhead::new(feed_rate)));
    (
        SimulatedStage::new(toolhead.clone()),
        SimulatedCamera::new(toolhead, model, max_frames),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_projection_follows_stage_motion() {
        let model = CameraModel::default();

        let frame = model.render([0.0, 0.0, 175.0]);
        let marker = frame.primary().unwrap();
        assert_relative_eq!(marker.center.x, 350.0);
        assert_relative_eq!(marker.center.y, 260.0);
        assert_relative_eq!(marker.corner_distance(0, 1), 100.0);

        // +X pulls the marker left, +Y pushes it down
        let moved = model.render([1.0, 1.0, 175.0]);
        let marker = moved.primary().unwrap();
        assert_relative_eq!(marker.center.x, 340.0);
        assert_relative_eq!(marker.center.y, 270.0);
    }

    #[test]
    fn test_marker_out_of_frame_is_not_detected() {
        let model = CameraModel::default();
        assert!(model.render([0.0, 0.0, 0.0]).primary().is_some());
        assert!(model.render([100.0, 0.0, 0.0]).is_empty());
    }

    #[test]
    fn test_stage_applies_programs_to_shared_toolhead() {
        let (mut stage, mut camera) = bench(50.0, CameraModel::default(), 1);
        let program = MotionProgram::from(vec![
            MotionPrimitive::SetAbsolute,
            MotionPrimitive::SetHeight(175.0),
        ]);
        assert!(matches!(
            stage.send_program(&program, Completion::WaitForMoves),
            Err(ChannelError::NotConnected)
        ));

        stage.connect().unwrap();
        stage.send_program(&program, Completion::WaitForMoves).unwrap();
        assert_relative_eq!(stage.toolhead().borrow().axis_position(Axis::Z), 175.0);

        match camera.next_event().unwrap() {
            Some(SourceEvent::Frame(frame)) => assert_eq!(frame.markers.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(camera.next_event().unwrap(), None);
    }

    #[test]
    fn test_injected_failures_are_transient() {
        let (stage, _camera) = bench(50.0, CameraModel::default(), 0);
        let mut stage = stage.failing_every(2);
        stage.connect().unwrap();

        let step = MotionProgram::from(MotionPrimitive::Move {
            axis: Axis::X,
            distance: 1.0,
        });
        stage.send_program(&step, Completion::Acknowledged).unwrap();
        let err = stage
            .send_program(&step, Completion::Acknowledged)
            .unwrap_err();
        assert!(err.is_transient());
        assert!(stage.is_connected());
        assert_relative_eq!(stage.toolhead().borrow().axis_position(Axis::X), 1.0);
    }
}
