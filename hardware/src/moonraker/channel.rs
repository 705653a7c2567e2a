//! [`CommandChannel`] over a Moonraker session.

use std::time::Duration;

use serde_json::Value;
use shared::calibration_config::MoonrakerSettings;
use shared::gcode::MotionProgram;
use tracing::{info, warn};

use super::client::MoonrakerClient;
use crate::channel::{ChannelError, ChannelResult, CommandChannel, Completion, ConnectionState};

/// Firmware barrier: acknowledged only once all queued moves have finished.
const WAIT_FOR_MOVES: &str = "M400";

/// RPC command channel.
///
/// Holds at most one live [`MoonrakerClient`]. Errors that leave the session
/// out of sync (timeouts, transport failures) drop it, so the next call
/// reports [`ChannelError::NotConnected`] until [`connect`](CommandChannel::connect)
/// is called again.
pub struct MoonrakerChannel {
    url: String,
    timeout: Option<Duration>,
    client: Option<MoonrakerClient>,
}

impl MoonrakerChannel {
    pub fn new(url: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            url: url.into(),
            timeout,
            client: None,
        }
    }

    pub fn from_settings(settings: &MoonrakerSettings) -> Self {
        Self::new(settings.url.clone(), settings.response_timeout())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run raw G-code text, bypassing the motion vocabulary.
    pub fn send_script(&mut self, script: &str) -> ChannelResult<Value> {
        let client = self.client.as_mut().ok_or(ChannelError::NotConnected)?;
        let result = client.run_script(script);

        if let Err(e) = &result {
            if matches!(
                e,
                ChannelError::Io(_)
                    | ChannelError::WebSocket(_)
                    | ChannelError::Timeout
                    | ChannelError::Closed
            ) {
                warn!("Dropping Moonraker session after error: {e}");
                self.client = None;
            }
        }

        result
    }
}

impl CommandChannel for MoonrakerChannel {
    fn connect(&mut self) -> ChannelResult<()> {
        if let Some(old) = self.client.take() {
            old.close();
        }
        self.client = Some(MoonrakerClient::connect(&self.url, self.timeout)?);
        info!("Moonraker channel connected to {}", self.url);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if self.client.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn send_program(
        &mut self,
        program: &MotionProgram,
        completion: Completion,
    ) -> ChannelResult<()> {
        if self.client.is_none() {
            return Err(ChannelError::NotConnected);
        }
        if program.is_empty() {
            return Ok(());
        }

        let mut script = program.to_script();
        if completion == Completion::WaitForMoves {
            script.push('\n');
            script.push_str(WAIT_FOR_MOVES);
        }

        self.send_script(&script).map(|_| ())
    }

    fn disconnect(&mut self) -> ChannelResult<()> {
        if let Some(client) = self.client.take() {
            client.close();
            info!("Moonraker channel disconnected");
        }
        Ok(())
    }
}

impl Drop for MoonrakerChannel {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
