//! The closed control loop.
//!
//! One cycle per frame: evaluate each detection against the acceptance
//! region, send at most one move per detection and wait for the channel to
//! accept it, then let the calibrator count the outcome. Stage transitions
//! are sent between cycles as absolute-height approaches followed by a
//! return to relative mode.
//!
//! Transient channel failures never end a run. A dropped move is simply not
//! made; a dropped home or stage entry stays owed and is retried at the start
//! of the next frame, which is otherwise skipped since it was captured before
//! the stage reached its height.

use std::thread;
use std::time::Duration;

use hardware::{ChannelError, CommandChannel, Completion};
use shared::calibration_config::CalibrationConfig;
use shared::feedback::FeedbackController;
use shared::gcode::{CommandAssembler, MotionProgram};
use shared::observation::FrameDetections;
use shared::stage::CalibrationStage;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::session::{stage_entry, Calibrator};
use crate::source::{FrameSource, SourceEvent};

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to connect to the stage: {0}")]
    Connect(#[source] ChannelError),

    #[error("Stage setup failed: {0}")]
    Setup(#[source] ChannelError),

    #[error("Command channel failed: {0}")]
    Channel(#[source] ChannelError),
}

/// Why a run ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Every stage completed
    Calibrated,
    /// The source asked to stop
    StopRequested,
    /// The source ran out of events
    SourceExhausted,
    /// The source failed; the stage was left where it was
    SourceFailed(String),
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub final_stage: CalibrationStage,
    pub completed: bool,
    pub frames: usize,
    pub commands_sent: usize,
    pub transient_failures: usize,
    pub target_scale: f64,
    pub stop_reason: StopReason,
}

/// A calibration run over one command channel and one frame source.
pub struct CalibrationRun<C, S> {
    channel: C,
    source: S,
    calibrator: Calibrator,
    controller: FeedbackController,
    assembler: CommandAssembler,
    settle_delay: Duration,
    frames: usize,
    commands_sent: usize,
    transient_failures: usize,
    homed: bool,
    pending_entry: Option<CalibrationStage>,
    entered_first_stage: bool,
}

impl<C: CommandChannel, S: FrameSource> CalibrationRun<C, S> {
    pub fn new(channel: C, source: S, config: &CalibrationConfig) -> Self {
        Self {
            channel,
            source,
            calibrator: Calibrator::from_config(config),
            controller: FeedbackController::new(config.feedback),
            assembler: CommandAssembler::new(config.base_distance, config.stage_heights),
            settle_delay: config.settle_delay(),
            frames: 0,
            commands_sent: 0,
            transient_failures: 0,
            homed: false,
            pending_entry: None,
            entered_first_stage: false,
        }
    }

    pub fn calibrator(&self) -> &Calibrator {
        &self.calibrator
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Hand back the channel and source once the run is over.
    pub fn into_parts(self) -> (C, S) {
        (self.channel, self.source)
    }

    /// Connect, home, walk the stages, disconnect.
    ///
    /// The channel is disconnected on every exit path, including errors.
    pub fn run(&mut self) -> Result<RunReport, RunError> {
        self.channel.connect().map_err(RunError::Connect)?;
        info!("Stage connected, starting calibration");

        let result = self.drive();

        if let Err(e) = self.channel.disconnect() {
            warn!("Disconnect failed: {e}");
        }

        let stop_reason = result?;
        let report = self.report(stop_reason);
        info!(
            "Calibration ended in {} after {} frames ({:?})",
            report.final_stage, report.frames, report.stop_reason
        );
        Ok(report)
    }

    fn report(&self, stop_reason: StopReason) -> RunReport {
        RunReport {
            final_stage: self.calibrator.stage(),
            completed: self.calibrator.is_completed(),
            frames: self.frames,
            commands_sent: self.commands_sent,
            transient_failures: self.transient_failures,
            target_scale: self.calibrator.target_scale(),
            stop_reason,
        }
    }

    fn drive(&mut self) -> Result<StopReason, RunError> {
        self.homed = false;
        self.entered_first_stage = false;
        self.pending_entry = Some(self.calibrator.stage());
        self.settle_pending()?;

        loop {
            let event = match self.source.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(StopReason::SourceExhausted),
                Err(e) => {
                    warn!("Frame source failed: {e}");
                    return Ok(StopReason::SourceFailed(e.to_string()));
                }
            };

            match event {
                SourceEvent::Frame(frame) => {
                    if self.process_frame(&frame)? {
                        return Ok(StopReason::Calibrated);
                    }
                }
                SourceEvent::Stop => return Ok(StopReason::StopRequested),
                SourceEvent::GrowRegion => {
                    let scale = self.calibrator.grow_region();
                    info!("Target scale grown to {scale:.3}");
                }
                SourceEvent::ShrinkRegion => {
                    let scale = self.calibrator.shrink_region();
                    info!("Target scale shrunk to {scale:.3}");
                }
            }
        }
    }

    /// One control cycle. Returns true once calibration has completed.
    ///
    /// A stage transition ends the cycle; detections left in the frame were
    /// seen from the old height.
    fn process_frame(&mut self, frame: &FrameDetections) -> Result<bool, RunError> {
        self.frames += 1;
        self.assembler.clear();

        let owed = !self.homed || self.pending_entry.is_some();
        if owed {
            self.settle_pending()?;
            debug!("Frame {}: predates setup motion, skipped", self.frames);
            return Ok(false);
        }

        let wanted = self.channel.requested_marker();
        let observations: Vec<_> = frame
            .observations()
            .filter(|obs| wanted.map_or(true, |id| id == obs.marker_id))
            .cloned()
            .collect();

        if observations.is_empty() {
            debug!("Frame {}: no marker", self.frames);
            return Ok(false);
        }

        for observation in observations {
            let region = self.calibrator.region(frame.size);
            let correction = self.controller.evaluate(&observation, &region);
            debug!(
                "Frame {}: marker {} at ({:.1}, {:.1}) -> {} x{:.2}",
                self.frames,
                observation.marker_id,
                observation.center.x,
                observation.center.y,
                correction.command,
                correction.multiplier
            );

            if let Some(step) = self
                .assembler
                .move_command(correction.command, correction.multiplier)
            {
                self.send_move(MotionProgram::from(step))?;
            }

            if let Some(stage) = self.calibrator.record(correction.command) {
                return self.advance(stage);
            }
        }

        Ok(false)
    }

    /// Send whatever setup motion is still owed: the initial home, then any
    /// pending stage entry. A transient failure leaves it owed.
    fn settle_pending(&mut self) -> Result<(), RunError> {
        if !self.homed {
            let home = MotionProgram::from(vec![self.assembler.home(), self.assembler.set_relative()]);
            if let Err(e) = self.channel.send_program(&home, Completion::WaitForMoves) {
                return self.tolerate(e, "home");
            }
            self.homed = true;
        }

        if let Some(stage) = self.pending_entry {
            if let Err(e) = self.enter_stage(stage) {
                return self.tolerate(e, "stage entry");
            }
            self.pending_entry = None;
            self.entered_first_stage = true;
        }

        Ok(())
    }

    /// Count and log a transient failure; anything else ends the run.
    fn tolerate(&mut self, error: ChannelError, what: &str) -> Result<(), RunError> {
        if error.is_transient() {
            self.transient_failures += 1;
            warn!("Will retry {what}: {error}");
            return Ok(());
        }
        if self.entered_first_stage {
            Err(RunError::Channel(error))
        } else {
            Err(RunError::Setup(error))
        }
    }

    fn send_move(&mut self, program: MotionProgram) -> Result<(), RunError> {
        match self.channel.send_program(&program, Completion::Acknowledged) {
            Ok(()) => {
                self.commands_sent += 1;
                if !self.settle_delay.is_zero() {
                    thread::sleep(self.settle_delay);
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                self.transient_failures += 1;
                warn!("Dropped {}: {e}", program.to_script());
                Ok(())
            }
            Err(e) => Err(RunError::Channel(e)),
        }
    }

    fn advance(&mut self, stage: CalibrationStage) -> Result<bool, RunError> {
        info!(
            "Entered {stage} (target scale {:.3})",
            self.calibrator.target_scale()
        );
        if stage.is_terminal() {
            return Ok(true);
        }

        self.pending_entry = Some(stage);
        self.settle_pending()?;
        Ok(false)
    }

    fn enter_stage(&mut self, stage: CalibrationStage) -> Result<(), ChannelError> {
        let Some(entry) = stage_entry(&mut self.assembler, stage) else {
            return Ok(());
        };
        self.channel
            .send_program(&entry.approach, Completion::WaitForMoves)?;
        self.channel
            .send_program(&entry.resume, Completion::Acknowledged)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ScriptedSource;
    use hardware::{ChannelResult, ConnectionState};
    use shared::image_size::ImageSize;
    use shared::observation::MarkerObservation;

    /// Records every script it is handed, optionally rejecting one script a
    /// number of times first.
    #[derive(Default)]
    struct RecordingChannel {
        connected: bool,
        sent: Vec<(String, Completion)>,
        marker: Option<u32>,
        reject: Option<(&'static str, usize)>,
    }

    impl RecordingChannel {
        fn rejecting(script: &'static str, times: usize) -> Self {
            Self {
                reject: Some((script, times)),
                ..Default::default()
            }
        }

        fn scripts(&self) -> Vec<&str> {
            self.sent.iter().map(|(s, _)| s.as_str()).collect()
        }
    }

    impl CommandChannel for RecordingChannel {
        fn connect(&mut self) -> ChannelResult<()> {
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
            let script = program.to_script();
            if let Some((rejected, remaining)) = self.reject.as_mut() {
                if *remaining > 0 && script == *rejected {
                    *remaining -= 1;
                    return Err(ChannelError::Remote {
                        code: Some(400),
                        message: "rejected".to_string(),
                    });
                }
            }
            self.sent.push((script, completion));
            Ok(())
        }

        fn disconnect(&mut self) -> ChannelResult<()> {
            self.connected = false;
            Ok(())
        }

        fn requested_marker(&self) -> Option<u32> {
            self.marker
        }
    }

    fn config() -> CalibrationConfig {
        CalibrationConfig {
            settle_delay_ms: 0,
            ..Default::default()
        }
    }

    fn frame(markers: Vec<MarkerObservation>) -> SourceEvent {
        SourceEvent::Frame(FrameDetections::new(
            ImageSize::from_width_height(640, 480),
            markers,
        ))
    }

    #[test]
    fn test_setup_sequence_and_single_move() {
        let source = ScriptedSource::new([
            frame(vec![MarkerObservation::square(1, 100.0, 240.0, 50.0)]),
            SourceEvent::Stop,
        ]);
        let mut run = CalibrationRun::new(RecordingChannel::default(), source, &config());
        let report = run.run().unwrap();

        assert_eq!(report.stop_reason, StopReason::StopRequested);
        assert_eq!(report.frames, 1);
        assert_eq!(report.commands_sent, 1);

        let (channel, _) = run.into_parts();
        assert!(!channel.connected);
        let scripts: Vec<_> = channel.sent.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(scripts[..3], ["G28\nG91", "G90\nG1 Z175", "G91"]);
        assert!(scripts[3].starts_with("G1 X-"), "{}", scripts[3]);
        assert_eq!(channel.sent[0].1, Completion::WaitForMoves);
        assert_eq!(channel.sent[1].1, Completion::WaitForMoves);
        assert_eq!(channel.sent[3].1, Completion::Acknowledged);
    }

    #[test]
    fn test_centered_frames_walk_stages() {
        let centered = || frame(vec![MarkerObservation::square(1, 320.0, 240.0, 50.0)]);
        let source = ScriptedSource::new(std::iter::repeat_with(centered).take(20));
        let mut run = CalibrationRun::new(RecordingChannel::default(), source, &config());
        let report = run.run().unwrap();

        assert_eq!(report.stop_reason, StopReason::Calibrated);
        assert!(report.completed);
        assert_eq!(report.final_stage, CalibrationStage::Calibrated);
        assert_eq!(report.frames, 15);
        assert_eq!(report.commands_sent, 0);

        let (channel, _) = run.into_parts();
        let approaches: Vec<_> = channel
            .sent
            .iter()
            .filter(|(s, _)| s.starts_with("G90"))
            .map(|(s, _)| s.as_str())
            .collect();
        assert_eq!(approaches, ["G90\nG1 Z175", "G90\nG1 Z100", "G90\nG1 Z25"]);
    }

    #[test]
    fn test_empty_frames_and_other_markers_do_not_count() {
        let mut events = Vec::new();
        for _ in 0..4 {
            events.push(frame(vec![MarkerObservation::square(2, 320.0, 240.0, 50.0)]));
        }
        events.push(frame(Vec::new()));
        events.push(frame(vec![MarkerObservation::square(9, 320.0, 240.0, 50.0)]));
        events.push(frame(vec![MarkerObservation::square(2, 320.0, 240.0, 50.0)]));

        let channel = RecordingChannel {
            marker: Some(2),
            ..Default::default()
        };
        let mut run = CalibrationRun::new(channel, ScriptedSource::new(events), &config());
        let report = run.run().unwrap();

        // Gaps leave the counter alone; the fifth centered sighting of marker 2 advances
        assert_eq!(report.final_stage, CalibrationStage::S2);
        assert_eq!(report.stop_reason, StopReason::SourceExhausted);
        assert_eq!(report.frames, 7);
    }

    #[test]
    fn test_region_events_adjust_scale() {
        let source = ScriptedSource::new([SourceEvent::GrowRegion, SourceEvent::GrowRegion]);
        let mut run = CalibrationRun::new(RecordingChannel::default(), source, &config());
        let report = run.run().unwrap();
        approx::assert_relative_eq!(report.target_scale, 0.11025, epsilon = 1e-9);
    }

    fn centered() -> SourceEvent {
        frame(vec![MarkerObservation::square(1, 320.0, 240.0, 50.0)])
    }

    #[test]
    fn test_rejected_stage_entry_is_retried_not_fatal() {
        let channel = RecordingChannel::rejecting("G90\nG1 Z100", usize::MAX);
        let source = ScriptedSource::new(std::iter::repeat_with(centered).take(20));
        let mut run = CalibrationRun::new(channel, source, &config());
        let report = run.run().unwrap();

        // Five frames to leave S1, then every later frame only retries the entry
        assert_eq!(report.stop_reason, StopReason::SourceExhausted);
        assert_eq!(report.final_stage, CalibrationStage::S2);
        assert_eq!(report.frames, 20);
        assert_eq!(report.transient_failures, 16);

        let (channel, _) = run.into_parts();
        assert!(!channel.connected);
        assert_eq!(channel.scripts(), ["G28\nG91", "G90\nG1 Z175", "G91"]);
    }

    #[test]
    fn test_stage_entry_recovers_after_one_rejection() {
        let channel = RecordingChannel::rejecting("G90\nG1 Z100", 1);
        let source = ScriptedSource::new(std::iter::repeat_with(centered).take(30));
        let mut run = CalibrationRun::new(channel, source, &config());
        let report = run.run().unwrap();

        // The frame that carries the retry is not counted toward S2
        assert_eq!(report.stop_reason, StopReason::Calibrated);
        assert_eq!(report.frames, 16);
        assert_eq!(report.transient_failures, 1);

        let (channel, _) = run.into_parts();
        assert_eq!(
            channel.scripts(),
            ["G28\nG91", "G90\nG1 Z175", "G91", "G90\nG1 Z100", "G91", "G90\nG1 Z25", "G91"]
        );
    }

    #[test]
    fn test_rejected_home_is_retried_before_any_move() {
        let channel = RecordingChannel::rejecting("G28\nG91", 2);
        let source = ScriptedSource::new([
            frame(vec![MarkerObservation::square(1, 100.0, 240.0, 50.0)]),
            frame(vec![MarkerObservation::square(1, 100.0, 240.0, 50.0)]),
        ]);
        let mut run = CalibrationRun::new(channel, source, &config());
        let report = run.run().unwrap();

        assert_eq!(report.transient_failures, 2);
        assert_eq!(report.commands_sent, 0);
        let (channel, _) = run.into_parts();
        assert_eq!(channel.scripts(), ["G28\nG91", "G90\nG1 Z175", "G91"]);
    }

    #[test]
    fn test_non_transient_setup_failure_aborts() {
        struct Unplugged(bool);

        impl CommandChannel for Unplugged {
            fn connect(&mut self) -> ChannelResult<()> {
                self.0 = true;
                Ok(())
            }

            fn state(&self) -> ConnectionState {
                if self.0 {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Disconnected
                }
            }

            fn send_program(&mut self, _: &MotionProgram, _: Completion) -> ChannelResult<()> {
                Err(ChannelError::Closed)
            }

            fn disconnect(&mut self) -> ChannelResult<()> {
                self.0 = false;
                Ok(())
            }
        }

        let source = ScriptedSource::new([centered()]);
        let mut run = CalibrationRun::new(Unplugged(false), source, &config());
        let err = run.run().unwrap_err();
        assert!(matches!(err, RunError::Setup(ChannelError::Closed)), "{err}");
        assert!(!run.channel().0);
    }

    #[test]
    fn test_transition_ends_the_cycle() {
        let mut events: Vec<_> = std::iter::repeat_with(centered).take(4).collect();
        events.push(frame(vec![
            MarkerObservation::square(1, 320.0, 240.0, 50.0),
            MarkerObservation::square(2, 100.0, 240.0, 50.0),
        ]));
        let mut run = CalibrationRun::new(
            RecordingChannel::default(),
            ScriptedSource::new(events),
            &config(),
        );
        let report = run.run().unwrap();

        assert_eq!(report.final_stage, CalibrationStage::S2);
        assert_eq!(report.commands_sent, 0);
        let (channel, _) = run.into_parts();
        assert_eq!(
            channel.scripts(),
            ["G28\nG91", "G90\nG1 Z175", "G91", "G90\nG1 Z100", "G91"]
        );
    }
}
