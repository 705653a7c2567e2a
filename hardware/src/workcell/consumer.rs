//! Firmware end of the workcell sockets.
//!
//! The consumer lives inside the firmware's timer loop and is driven by
//! [`tick`](WorkcellConsumer::tick). It never blocks: the command socket is
//! non-blocking and each tick does at most one unit of work.

use std::io::{self, Write};
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use shared::calibration_config::WorkcellSettings;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::busy_gate::{BusyGate, MotionExecutor, PollBackoff};
use super::protocol::{CommandMessage, Handshake, MAX_MESSAGE_LEN};
use super::{remove_stale_socket, set_socket_permissions, unlink_socket};

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Consumer already running on marker {0}")]
    AlreadyRunning(u32),

    #[error("Failed to bind command socket {path}: {source}")]
    Bind { path: PathBuf, source: io::Error },

    #[error("Controller not reachable on {path}: {source}")]
    ControllerUnreachable { path: PathBuf, source: io::Error },
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Not started, nothing to do
    Stopped,
    /// Executor busy, nothing pending
    Busy,
    /// Asked for a command, none arrived yet
    Waiting,
    /// Ran a command
    Executed(String),
    /// Holding a command until the executor is idle
    Deferred,
    /// Executor refused a command
    Rejected { script: String, reason: String },
    /// Controller sent `DONE`; the consumer has stopped
    Finished { marker_id: u32 },
}

/// Result of a tick plus when to run the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub outcome: TickOutcome,
    pub next_poll: Duration,
}

struct Session {
    marker_id: u32,
    socket: UnixDatagram,
    pending: Option<String>,
}

pub struct WorkcellConsumer {
    command_path: PathBuf,
    control_path: PathBuf,
    gate: BusyGate,
    backoff: PollBackoff,
    session: Option<Session>,
}

impl WorkcellConsumer {
    pub fn new(settings: &WorkcellSettings) -> Self {
        Self {
            command_path: settings.command_socket.clone(),
            control_path: settings.control_socket.clone(),
            gate: BusyGate::new(settings.busy_threshold),
            backoff: PollBackoff::new(settings.poll_min(), settings.poll_max()),
            session: None,
        }
    }

    pub fn command_path(&self) -> &Path {
        &self.command_path
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub fn marker_id(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.marker_id)
    }

    pub fn has_pending(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.pending.is_some())
    }

    /// Bind the command socket and announce `START <marker_id>`.
    ///
    /// Nothing stays bound if the controller cannot be reached.
    pub fn start(&mut self, marker_id: u32) -> Result<(), ConsumerError> {
        if let Some(session) = &self.session {
            return Err(ConsumerError::AlreadyRunning(session.marker_id));
        }

        let bind_err = |source| ConsumerError::Bind {
            path: self.command_path.clone(),
            source,
        };
        remove_stale_socket(&self.command_path).map_err(bind_err)?;
        let socket = UnixDatagram::bind(&self.command_path).map_err(bind_err)?;
        let configured = socket
            .set_nonblocking(true)
            .and_then(|()| set_socket_permissions(&self.command_path));
        if let Err(e) = configured {
            unlink_socket(&self.command_path);
            return Err(bind_err(e));
        }

        if let Err(source) = self.handshake(Handshake::Start(marker_id)) {
            unlink_socket(&self.command_path);
            return Err(ConsumerError::ControllerUnreachable {
                path: self.control_path.clone(),
                source,
            });
        }

        info!("Workcell consumer moving to marker {marker_id}");
        self.backoff.active();
        self.session = Some(Session {
            marker_id,
            socket,
            pending: None,
        });
        Ok(())
    }

    fn handshake(&self, message: Handshake) -> io::Result<()> {
        let mut stream = UnixStream::connect(&self.control_path)?;
        stream.write_all(message.to_string().as_bytes())?;
        debug!("Handshake sent: {message}");
        Ok(())
    }

    /// Run one poll cycle at executor time `now`.
    pub fn tick(&mut self, now: f64, executor: &mut dyn MotionExecutor) -> Tick {
        let Some(session) = self.session.as_mut() else {
            return Tick {
                outcome: TickOutcome::Stopped,
                next_poll: self.backoff.current(),
            };
        };

        if self.gate.is_busy(&executor.status(now)) {
            let outcome = if session.pending.is_some() {
                TickOutcome::Deferred
            } else {
                TickOutcome::Busy
            };
            return Tick {
                outcome,
                next_poll: self.backoff.current(),
            };
        }

        if let Some(script) = session.pending.take() {
            return self.execute(script, now, executor);
        }

        let marker_id = session.marker_id;
        match self.receive() {
            None => {
                // Only ask once idle with nothing queued, so a REQUEST also
                // tells the controller every earlier command has finished
                if let Err(e) = self.handshake(Handshake::Request(marker_id)) {
                    warn!("REQUEST {marker_id} not delivered: {e}");
                }
                Tick {
                    outcome: TickOutcome::Waiting,
                    next_poll: self.backoff.idle(),
                }
            }
            Some(CommandMessage::Done) => {
                info!("Workcell consumer finished marker {marker_id}");
                self.stop();
                Tick {
                    outcome: TickOutcome::Finished { marker_id },
                    next_poll: self.backoff.active(),
                }
            }
            Some(CommandMessage::Script(script)) => {
                if self.gate.is_busy(&executor.status(now)) {
                    if let Some(session) = self.session.as_mut() {
                        session.pending = Some(script);
                    }
                    Tick {
                        outcome: TickOutcome::Deferred,
                        next_poll: self.backoff.active(),
                    }
                } else {
                    self.execute(script, now, executor)
                }
            }
        }
    }

    fn receive(&self) -> Option<CommandMessage> {
        let session = self.session.as_ref()?;
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        match session.socket.recv(&mut buf) {
            Ok(len) => match CommandMessage::from_bytes(&buf[..len]) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Ignoring command datagram: {e}");
                    None
                }
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!("Command socket receive failed: {e}");
                None
            }
        }
    }

    fn execute(&mut self, script: String, now: f64, executor: &mut dyn MotionExecutor) -> Tick {
        let outcome = match executor.run_script(&script, now) {
            Ok(()) => {
                debug!("Executed {:?}", script);
                TickOutcome::Executed(script)
            }
            Err(reason) => {
                warn!("Executor rejected {:?}: {reason}", script);
                TickOutcome::Rejected { script, reason }
            }
        };
        Tick {
            outcome,
            next_poll: self.backoff.active(),
        }
    }

    /// Unbind the command socket and forget the session.
    pub fn stop(&mut self) {
        if self.session.take().is_some() {
            unlink_socket(&self.command_path);
        }
    }
}

impl Drop for WorkcellConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}
