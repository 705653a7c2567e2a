//! [`CommandChannel`] over the workcell sockets.

use std::time::{Duration, Instant};

use shared::calibration_config::WorkcellSettings;
use shared::gcode::MotionProgram;
use tracing::{info, warn};

use super::link::WorkcellLink;
use super::protocol::DONE;
use crate::channel::{ChannelError, ChannelResult, CommandChannel, Completion, ConnectionState};

/// Longest wait for a final `REQUEST` before giving up on sending `DONE`.
const DONE_TIMEOUT: Duration = Duration::from_secs(5);

/// IPC command channel.
///
/// Every primitive goes out as its own datagram, each gated on a fresh
/// `REQUEST`. The consumer only requests while its toolhead is idle and its
/// queue is empty, so a request armed after the last line means the motion
/// has physically finished. Requests armed within `poll_min` of that send may
/// predate it and are ignored by the barrier.
pub struct WorkcellChannel {
    settings: WorkcellSettings,
    link: Option<WorkcellLink>,
}

impl WorkcellChannel {
    pub fn new(settings: WorkcellSettings) -> Self {
        Self {
            settings,
            link: None,
        }
    }

    pub fn settings(&self) -> &WorkcellSettings {
        &self.settings
    }

    pub fn link(&self) -> Option<&WorkcellLink> {
        self.link.as_ref()
    }
}

impl CommandChannel for WorkcellChannel {
    /// Bind the control socket and block until the consumer sends `START`.
    fn connect(&mut self) -> ChannelResult<()> {
        self.disconnect()?;

        let link = WorkcellLink::bind(&self.settings.command_socket, &self.settings.control_socket)?;
        info!(
            "Waiting for workcell consumer on {}",
            self.settings.control_socket.display()
        );

        // Dropping the link on failure unbinds the socket
        let marker_id = link
            .wait_for_start(self.settings.start_timeout())
            .map_err(|e| ChannelError::ConnectionFailed(format!("No START from consumer: {e}")))?;

        info!("Workcell consumer started on marker {marker_id}");
        self.link = Some(link);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        match &self.link {
            Some(link) if link.is_started() => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    fn send_program(
        &mut self,
        program: &MotionProgram,
        completion: Completion,
    ) -> ChannelResult<()> {
        let link = self.link.as_ref().ok_or(ChannelError::NotConnected)?;
        if program.is_empty() {
            return Ok(());
        }

        let timeout = self.settings.request_timeout();
        let mut sent_at = Instant::now();
        for line in program.lines() {
            sent_at = link.send_command(&line, timeout)?;
        }

        if completion == Completion::WaitForMoves {
            link.await_ready_since(sent_at, self.settings.poll_min(), timeout)?;
        }
        Ok(())
    }

    /// Send `DONE` if a session is running, then unbind.
    fn disconnect(&mut self) -> ChannelResult<()> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };

        if link.is_started() {
            let timeout = self
                .settings
                .request_timeout()
                .map_or(DONE_TIMEOUT, |t| t.min(DONE_TIMEOUT));
            if let Err(e) = link.send_command(DONE, Some(timeout)) {
                warn!("Consumer did not take DONE: {e}");
            }
        }

        link.close();
        Ok(())
    }

    fn requested_marker(&self) -> Option<u32> {
        self.link.as_ref().and_then(WorkcellLink::marker_id)
    }
}

impl Drop for WorkcellChannel {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
