//! Controller link and firmware consumer talking over real Unix sockets.

#![cfg(all(unix, feature = "workcell"))]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use hardware::workcell::protocol::DONE;
use hardware::workcell::{
    MotionExecutor, SimulatedToolhead, TickOutcome, ToolheadStatus, WorkcellChannel,
    WorkcellConsumer, WorkcellLink,
};
use hardware::{CommandChannel, Completion, ConnectionState};
use shared::calibration_config::WorkcellSettings;
use shared::gcode::{Axis, MotionPrimitive, MotionProgram};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(5);

fn settings(dir: &TempDir) -> WorkcellSettings {
    WorkcellSettings {
        command_socket: dir.path().join("command.sock"),
        control_socket: dir.path().join("control.sock"),
        start_timeout_ms: Some(5_000),
        request_timeout_ms: Some(5_000),
        poll_min_ms: 1,
        poll_max_ms: 10,
        ..Default::default()
    }
}

fn send_raw(control: &Path, message: &str) {
    let mut stream = UnixStream::connect(control).unwrap();
    stream.write_all(message.as_bytes()).unwrap();
}

/// Executor whose busy state follows a script, one entry per status query.
struct ScriptedExecutor {
    busy: RefCell<VecDeque<bool>>,
    ran: Vec<String>,
}

impl ScriptedExecutor {
    fn new(busy: &[bool]) -> Self {
        Self {
            busy: RefCell::new(busy.iter().copied().collect()),
            ran: Vec::new(),
        }
    }
}

impl MotionExecutor for ScriptedExecutor {
    fn status(&self, now: f64) -> ToolheadStatus {
        let busy = self.busy.borrow_mut().pop_front().unwrap_or(false);
        ToolheadStatus {
            print_time: if busy { now + 1.0 } else { now - 1.0 },
            est_print_time: now,
            lookahead_empty: !busy,
        }
    }

    fn run_script(&mut self, script: &str, _now: f64) -> Result<(), String> {
        self.ran.push(script.to_string());
        Ok(())
    }
}

#[test]
fn test_start_latches_and_request_does_not_relatch() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let link = WorkcellLink::bind(&settings.command_socket, &settings.control_socket).unwrap();
    assert!(!link.is_started());

    let mut consumer = WorkcellConsumer::new(&settings);
    consumer.start(7).unwrap();

    assert_eq!(link.wait_for_start(Some(TIMEOUT)).unwrap(), 7);
    assert!(link.is_awaiting());

    // Consume the START readiness
    link.send_command("G91", Some(TIMEOUT)).unwrap();
    assert!(!link.is_awaiting());

    // Handshakes are handled in arrival order
    send_raw(&settings.control_socket, "START 3");
    send_raw(&settings.control_socket, "not a handshake");
    send_raw(&settings.control_socket, "REQUEST 9");
    link.await_ready(Some(TIMEOUT)).unwrap();

    assert_eq!(link.marker_id(), Some(7));
    assert!(link.is_awaiting());
}

#[test]
fn test_command_delivery_and_done_teardown() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let mut link = WorkcellLink::bind(&settings.command_socket, &settings.control_socket).unwrap();
    let mut consumer = WorkcellConsumer::new(&settings);
    let mut head = SimulatedToolhead::new(100.0);

    consumer.start(7).unwrap();
    assert!(settings.command_socket.exists());
    link.wait_for_start(Some(TIMEOUT)).unwrap();

    link.send_command("G91", Some(TIMEOUT)).unwrap();
    let tick = consumer.tick(1.0, &mut head);
    assert_eq!(tick.outcome, TickOutcome::Executed("G91".to_string()));
    assert!(head.is_relative());

    // Idle with nothing queued: asks for more
    let tick = consumer.tick(2.0, &mut head);
    assert_eq!(tick.outcome, TickOutcome::Waiting);

    link.send_command(DONE, Some(TIMEOUT)).unwrap();
    assert!(!link.is_started());
    assert_eq!(link.marker_id(), None);

    let tick = consumer.tick(3.0, &mut head);
    assert_eq!(tick.outcome, TickOutcome::Finished { marker_id: 7 });
    assert!(!consumer.is_running());
    assert!(!settings.command_socket.exists());

    link.close();
    assert!(!settings.control_socket.exists());
}

#[test]
fn test_consumer_defers_while_busy() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let link = WorkcellLink::bind(&settings.command_socket, &settings.control_socket).unwrap();
    let mut consumer = WorkcellConsumer::new(&settings);
    consumer.start(4).unwrap();
    link.wait_for_start(Some(TIMEOUT)).unwrap();
    link.send_command("G1 X1", Some(TIMEOUT)).unwrap();

    // Idle when checked, busy again by the time the command is read
    let mut executor = ScriptedExecutor::new(&[false, true, true, false]);

    let tick = consumer.tick(0.0, &mut executor);
    assert_eq!(tick.outcome, TickOutcome::Deferred);
    assert!(consumer.has_pending());

    let tick = consumer.tick(0.1, &mut executor);
    assert_eq!(tick.outcome, TickOutcome::Deferred);
    assert!(executor.ran.is_empty());

    let tick = consumer.tick(0.2, &mut executor);
    assert_eq!(tick.outcome, TickOutcome::Executed("G1 X1".to_string()));
    assert_eq!(executor.ran, vec!["G1 X1".to_string()]);
    assert!(!consumer.has_pending());
}

#[test]
fn test_motion_barrier_ignores_request_racing_the_send() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let link = WorkcellLink::bind(&settings.command_socket, &settings.control_socket).unwrap();
    let mut consumer = WorkcellConsumer::new(&settings);
    consumer.start(5).unwrap();
    link.wait_for_start(Some(TIMEOUT)).unwrap();

    let grace = Duration::from_millis(200);
    let sent_at = link.send_command("G1 X1", Some(TIMEOUT)).unwrap();

    // Written before the consumer could have seen the command
    send_raw(&settings.control_socket, "REQUEST 5");
    let early = link.await_ready_since(sent_at, grace, Some(Duration::from_millis(100)));
    assert!(matches!(early, Err(hardware::ChannelError::Timeout)), "{early:?}");

    thread::sleep(grace);
    send_raw(&settings.control_socket, "REQUEST 5");
    link.await_ready_since(sent_at, grace, Some(TIMEOUT)).unwrap();
    assert!(link.is_awaiting());

    consumer.stop();
}

#[test]
fn test_consumer_rejects_second_start() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let _link = WorkcellLink::bind(&settings.command_socket, &settings.control_socket).unwrap();
    let mut consumer = WorkcellConsumer::new(&settings);
    consumer.start(1).unwrap();
    assert!(consumer.start(2).is_err());
    assert_eq!(consumer.marker_id(), Some(1));

    consumer.stop();
    assert!(!settings.command_socket.exists());
}

#[test]
fn test_channel_drives_simulated_toolhead() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);

    let head = Arc::new(Mutex::new(SimulatedToolhead::new(500.0)));
    let clock = Instant::now();

    let consumer_thread = {
        let settings = settings.clone();
        let head = head.clone();
        thread::spawn(move || {
            let mut consumer = WorkcellConsumer::new(&settings);
            let deadline = Instant::now() + TIMEOUT;
            while let Err(e) = consumer.start(7) {
                assert!(Instant::now() < deadline, "consumer never started: {e}");
                thread::sleep(Duration::from_millis(5));
            }
            loop {
                let tick = {
                    let mut head = head.lock().unwrap();
                    consumer.tick(clock.elapsed().as_secs_f64(), &mut *head)
                };
                if let TickOutcome::Finished { marker_id } = tick.outcome {
                    return marker_id;
                }
                assert!(Instant::now() < deadline + TIMEOUT, "consumer never finished");
                thread::sleep(tick.next_poll);
            }
        })
    };

    let mut channel = WorkcellChannel::new(settings.clone());
    channel.connect().unwrap();
    assert_eq!(channel.state(), ConnectionState::Connected);
    assert_eq!(channel.requested_marker(), Some(7));

    let entry = MotionProgram::from(vec![
        MotionPrimitive::SetAbsolute,
        MotionPrimitive::SetHeight(25.0),
    ]);
    channel.send_program(&entry, Completion::WaitForMoves).unwrap();
    {
        // The barrier only returns once the move has physically finished
        let head = head.lock().unwrap();
        assert_relative_eq!(head.axis_position(Axis::Z), 25.0);
        assert!(clock.elapsed().as_secs_f64() >= head.busy_until());
    }

    let nudge = MotionProgram::from(vec![
        MotionPrimitive::SetRelative,
        MotionPrimitive::Move {
            axis: Axis::X,
            distance: 1.5,
        },
    ]);
    channel.send_program(&nudge, Completion::Acknowledged).unwrap();

    channel.disconnect().unwrap();
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert_eq!(consumer_thread.join().unwrap(), 7);

    let head = head.lock().unwrap();
    assert_eq!(
        head.history(),
        &[
            MotionPrimitive::SetAbsolute,
            MotionPrimitive::SetHeight(25.0),
            MotionPrimitive::SetRelative,
            MotionPrimitive::Move {
                axis: Axis::X,
                distance: 1.5
            },
        ]
    );
    assert_relative_eq!(head.axis_position(Axis::X), 1.5);
    assert!(!settings.command_socket.exists());
    assert!(!settings.control_socket.exists());
}
