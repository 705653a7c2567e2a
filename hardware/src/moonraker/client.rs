//! Blocking WebSocket transport to a Moonraker host.
//!
//! One request is outstanding at a time. After sending, the client reads
//! frames until the response carrying the same id arrives; broadcast
//! notifications in between are skipped.
//!
//! # Example
//!
//! ```no_run
//! use hardware::moonraker::MoonrakerClient;
//! use std::time::Duration;
//!
//! let mut client = MoonrakerClient::connect(
//!     "ws://192.168.0.100:7125/websocket",
//!     Some(Duration::from_secs(120)),
//! )?;
//! client.run_script("G28")?;
//! client.close();
//! # Ok::<(), hardware::ChannelError>(())
//! ```

use std::net::TcpStream;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace, warn};
use tungstenite::protocol::WebSocket;
use tungstenite::Message;
use url::Url;

use super::rpc::{classify, RpcMessage, RpcRequest, GCODE_RESPONSE_NOTIFICATION};
use crate::channel::{ChannelError, ChannelResult};

/// Moonraker's default HTTP/WebSocket port.
pub const DEFAULT_PORT: u16 = 7125;

/// An open JSON-RPC session.
pub struct MoonrakerClient {
    socket: WebSocket<TcpStream>,
    next_id: u64,
}

impl MoonrakerClient {
    /// Open the WebSocket at `url`.
    ///
    /// `timeout` bounds the handshake and every wait for a response; `None`
    /// blocks indefinitely. The request id counter starts at 1.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ConnectionFailed`] if the URL is not a `ws://`
    /// URL, `timeout` is zero, the TCP connection fails, or the upgrade is
    /// refused.
    pub fn connect(url: &str, timeout: Option<Duration>) -> ChannelResult<Self> {
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(ChannelError::ConnectionFailed(
                "Response timeout must be non-zero; use None to wait indefinitely".to_string(),
            ));
        }

        let parsed = Url::parse(url)
            .map_err(|e| ChannelError::ConnectionFailed(format!("Invalid URL {url}: {e}")))?;
        if parsed.scheme() != "ws" {
            return Err(ChannelError::ConnectionFailed(format!(
                "Unsupported scheme '{}', expected ws://",
                parsed.scheme()
            )));
        }

        let addrs = parsed
            .socket_addrs(|| Some(DEFAULT_PORT))
            .map_err(|e| ChannelError::ConnectionFailed(format!("Cannot resolve {url}: {e}")))?;
        let stream = TcpStream::connect(&addrs[..])
            .map_err(|e| ChannelError::ConnectionFailed(format!("Failed to connect: {e}")))?;

        let configure = |stream: &TcpStream| -> std::io::Result<()> {
            stream.set_read_timeout(timeout)?;
            stream.set_write_timeout(timeout)?;
            stream.set_nodelay(true)
        };
        configure(&stream)
            .map_err(|e| ChannelError::ConnectionFailed(format!("Failed to configure socket: {e}")))?;

        let (socket, _response) = tungstenite::client(url, stream).map_err(|e| {
            ChannelError::ConnectionFailed(format!("WebSocket handshake failed: {e}"))
        })?;

        debug!("Connected to Moonraker at {url}");

        Ok(Self { socket, next_id: 1 })
    }

    /// Id the next request will carry.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Run a G-code script and wait for its response.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Remote`] when the firmware rejects the script; the
    /// session stays usable. Transport errors and [`ChannelError::Timeout`]
    /// leave the session out of sync and it should be discarded.
    pub fn run_script(&mut self, script: &str) -> ChannelResult<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let request = RpcRequest::gcode_script(id, script);
        let text = serde_json::to_string(&request)?;

        debug!("RPC send [{id}]: {:?}", script);
        self.socket.send(Message::text(text)).map_err(ws_error)?;

        self.await_response(id)
    }

    fn await_response(&mut self, id: u64) -> ChannelResult<Value> {
        loop {
            let message = self.socket.read().map_err(ws_error)?;
            let text = match message {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    debug!("Moonraker closed the connection: {:?}", frame);
                    return Err(ChannelError::Closed);
                }
                Message::Binary(_) => {
                    warn!("Ignoring binary frame from Moonraker");
                    continue;
                }
                _ => continue,
            };

            match classify(&text) {
                Ok(RpcMessage::Response { id: got, outcome }) if got == id => {
                    trace!("RPC recv [{id}]: {}", text.as_str());
                    return outcome.map_err(|e| ChannelError::Remote {
                        code: e.code,
                        message: e.message,
                    });
                }
                Ok(RpcMessage::Response { id: got, .. }) => {
                    warn!("Skipping response for id {got} while waiting on {id}");
                }
                Ok(RpcMessage::Notification { method }) if method == GCODE_RESPONSE_NOTIFICATION => {
                    trace!("gcode response: {}", text.as_str());
                }
                Ok(RpcMessage::Notification { method }) => {
                    trace!("Skipping notification {method}");
                }
                Ok(RpcMessage::Other(_)) => {
                    trace!("Skipping message without id: {}", text.as_str());
                }
                Err(e) => {
                    warn!("Skipping malformed frame: {e}");
                }
            }
        }
    }

    /// Send a close frame. Errors are ignored; the peer may already be gone.
    pub fn close(mut self) {
        if let Err(e) = self.socket.close(None) {
            trace!("Close frame not sent: {e}");
        }
        let _ = self.socket.flush();
        debug!("Moonraker connection closed");
    }
}

fn ws_error(err: tungstenite::Error) -> ChannelError {
    use std::io::ErrorKind;
    match err {
        tungstenite::Error::Io(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            ChannelError::Timeout
        }
        tungstenite::Error::Io(e) => ChannelError::Io(e),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ChannelError::Closed
        }
        other => ChannelError::WebSocket(other.to_string()),
    }
}
