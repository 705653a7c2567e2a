//! Controller end of the workcell sockets.
//!
//! A background thread accepts handshakes on the control socket and arms a
//! single-slot readiness channel. Senders block on that channel, so at most
//! one command is handed to the consumer per `REQUEST`, and any number of
//! `REQUEST`s that pile up while nothing is sent collapse into one.
//!
//! Each readiness token carries the instant the accept thread armed it. A
//! `REQUEST` the consumer wrote just before a command datagram reached its
//! queue can still be in flight after the send; [`WorkcellLink::await_ready_since`]
//! ignores tokens armed too soon after a send to filter those out. A stale
//! handshake delayed by more than that grace period is not detected.

use std::io::Read;
use std::os::unix::net::{UnixDatagram, UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::protocol::{Handshake, DONE, MAX_MESSAGE_LEN};
use super::{remove_stale_socket, set_socket_permissions, unlink_socket};
use crate::channel::{ChannelError, ChannelResult};

/// Upper bound on how long one handshake connection may take to deliver.
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Session bookkeeping updated by the accept thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeState {
    pub marker_id: Option<u32>,
    pub started: bool,
}

/// Effect of one handshake on [`HandshakeState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEffect {
    /// New session on this marker; consumer awaits its first command
    Started(u32),
    /// Running session; consumer awaits another command
    Rearmed,
    /// Not valid in the current state
    Ignored,
}

impl HandshakeEffect {
    pub fn arms(self) -> bool {
        !matches!(self, HandshakeEffect::Ignored)
    }
}

impl HandshakeState {
    /// Apply a handshake.
    ///
    /// `START` only counts while idle and `REQUEST` only while started; the
    /// latched marker id is never replaced mid-session.
    pub fn apply(&mut self, handshake: Handshake) -> HandshakeEffect {
        match handshake {
            Handshake::Start(id) if !self.started => {
                self.marker_id = Some(id);
                self.started = true;
                HandshakeEffect::Started(id)
            }
            Handshake::Request(_) if self.started => HandshakeEffect::Rearmed,
            _ => HandshakeEffect::Ignored,
        }
    }

    /// Forget the session after `DONE`.
    pub fn end(&mut self) {
        self.marker_id = None;
        self.started = false;
    }
}

/// Bound control socket plus the accept thread serving it.
pub struct WorkcellLink {
    command_path: PathBuf,
    control_path: PathBuf,
    command_socket: UnixDatagram,
    state: Arc<Mutex<HandshakeState>>,
    ready_tx: Sender<Instant>,
    ready_rx: Receiver<Instant>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl WorkcellLink {
    /// Bind the control socket at `control_path` and start accepting.
    ///
    /// Commands go to the datagram socket the consumer binds at
    /// `command_path`.
    pub fn bind(command_path: &Path, control_path: &Path) -> ChannelResult<Self> {
        let bind_err = |e: std::io::Error| {
            ChannelError::ConnectionFailed(format!(
                "Failed to bind control socket {}: {e}",
                control_path.display()
            ))
        };

        remove_stale_socket(control_path).map_err(bind_err)?;
        let listener = UnixListener::bind(control_path).map_err(bind_err)?;
        if let Err(e) = set_socket_permissions(control_path) {
            unlink_socket(control_path);
            return Err(bind_err(e));
        }

        let command_socket = match UnixDatagram::unbound() {
            Ok(socket) => socket,
            Err(e) => {
                unlink_socket(control_path);
                return Err(e.into());
            }
        };

        let state = Arc::new(Mutex::new(HandshakeState::default()));
        let (ready_tx, ready_rx) = bounded(1);
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_thread = {
            let state = state.clone();
            let ready_tx = ready_tx.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("workcell-accept".into())
                .spawn(move || Self::accept_loop(listener, state, ready_tx, shutdown))
        };
        let accept_thread = match accept_thread {
            Ok(handle) => handle,
            Err(e) => {
                unlink_socket(control_path);
                return Err(e.into());
            }
        };

        info!("Workcell control socket bound at {}", control_path.display());

        Ok(Self {
            command_path: command_path.to_path_buf(),
            control_path: control_path.to_path_buf(),
            command_socket,
            state,
            ready_tx,
            ready_rx,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    fn accept_loop(
        listener: UnixListener,
        state: Arc<Mutex<HandshakeState>>,
        ready_tx: Sender<Instant>,
        shutdown: Arc<AtomicBool>,
    ) {
        for stream in listener.incoming() {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => Self::handle_connection(stream, &state, &ready_tx),
                Err(e) => warn!("Control socket accept failed: {e}"),
            }
        }
        debug!("Workcell accept thread exiting");
    }

    fn handle_connection(
        stream: UnixStream,
        state: &Mutex<HandshakeState>,
        ready_tx: &Sender<Instant>,
    ) {
        if let Err(e) = stream.set_read_timeout(Some(HANDSHAKE_READ_TIMEOUT)) {
            warn!("Cannot set handshake timeout: {e}");
        }

        let mut buf = Vec::with_capacity(64);
        if let Err(e) = stream.take(MAX_MESSAGE_LEN as u64).read_to_end(&mut buf) {
            warn!("Failed to read handshake: {e}");
            return;
        }

        let handshake = match Handshake::from_bytes(&buf) {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("Ignoring control message {:?}: {e}", String::from_utf8_lossy(&buf));
                return;
            }
        };

        let effect = state.lock().unwrap().apply(handshake);
        match effect {
            HandshakeEffect::Started(id) => info!("Consumer started session on marker {id}"),
            HandshakeEffect::Rearmed => debug!("Consumer requested next command"),
            HandshakeEffect::Ignored => {
                warn!("Ignoring '{handshake}' in state {:?}", *state.lock().unwrap());
            }
        }

        if effect.arms() {
            // Full slot: already awaiting, requests collapse
            let _ = ready_tx.try_send(Instant::now());
        }
    }

    pub fn command_path(&self) -> &Path {
        &self.command_path
    }

    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.lock().unwrap()
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    /// Marker latched by the current session's `START`.
    pub fn marker_id(&self) -> Option<u32> {
        self.state().marker_id
    }

    /// True if the consumer has asked for a command that has not been sent.
    pub fn is_awaiting(&self) -> bool {
        !self.ready_rx.is_empty()
    }

    fn take_ready(&self, timeout: Option<Duration>) -> ChannelResult<Instant> {
        match timeout {
            Some(timeout) => self.ready_rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => ChannelError::Timeout,
                RecvTimeoutError::Disconnected => ChannelError::Closed,
            }),
            None => self.ready_rx.recv().map_err(|_| ChannelError::Closed),
        }
    }

    /// Block until the consumer is ready without consuming the readiness.
    pub fn await_ready(&self, timeout: Option<Duration>) -> ChannelResult<()> {
        let armed_at = self.take_ready(timeout)?;
        // Full means the accept thread re-armed in between; still armed either way
        let _ = self.ready_tx.try_send(armed_at);
        Ok(())
    }

    /// Like [`await_ready`](Self::await_ready), but only readiness armed at
    /// least `grace` after `sent_at` counts; earlier tokens are discarded.
    ///
    /// The consumer repeats `REQUEST` on every idle poll, so a discarded
    /// token is replaced one poll later.
    pub fn await_ready_since(
        &self,
        sent_at: Instant,
        grace: Duration,
        timeout: Option<Duration>,
    ) -> ChannelResult<()> {
        let fresh_after = sent_at + grace;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let armed_at = self.take_ready(remaining)?;
            if armed_at >= fresh_after {
                let _ = self.ready_tx.try_send(armed_at);
                return Ok(());
            }
            debug!(
                "Discarding readiness armed {:?} after the last send",
                armed_at.saturating_duration_since(sent_at)
            );
        }
    }

    /// Block until the consumer's `START` arrives.
    pub fn wait_for_start(&self, timeout: Option<Duration>) -> ChannelResult<u32> {
        self.await_ready(timeout)?;
        self.marker_id().ok_or(ChannelError::SessionEnded)
    }

    /// Send one command once the consumer asks for it.
    ///
    /// Sending [`DONE`] ends the session. Returns the instant the datagram
    /// went out.
    pub fn send_command(&self, line: &str, timeout: Option<Duration>) -> ChannelResult<Instant> {
        if !self.is_started() {
            return Err(ChannelError::SessionEnded);
        }

        self.take_ready(timeout)?;
        self.command_socket
            .send_to(line.as_bytes(), &self.command_path)?;
        let sent_at = Instant::now();
        debug!("Workcell send: {:?}", line);

        // A REQUEST that raced this send predates it; the consumer repeats
        // REQUEST on every idle poll, so dropping it only costs one poll
        let _ = self.ready_rx.try_recv();

        if line == DONE {
            self.state.lock().unwrap().end();
            info!("Workcell session ended");
        }

        Ok(sent_at)
    }

    /// Stop the accept thread and remove the control socket file.
    pub fn close(&mut self) {
        let Some(handle) = self.accept_thread.take() else {
            return;
        };

        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the blocking accept
        if let Err(e) = UnixStream::connect(&self.control_path) {
            debug!("Wake connection failed: {e}");
        }
        if handle.join().is_err() {
            warn!("Workcell accept thread panicked");
        }

        unlink_socket(&self.control_path);
        info!("Workcell control socket closed");
    }
}

impl Drop for WorkcellLink {
    fn drop(&mut self) {
        self.close();
    }
}
