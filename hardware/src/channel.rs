//! Command channel interface shared by all stage backends.

use shared::gcode::MotionProgram;
use thiserror::Error;

/// Errors that can occur while delivering motion programs to the stage.
///
/// Use [`is_transient`](ChannelError::is_transient) to decide whether a
/// control loop can drop the current command and carry on.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Low-level I/O error (socket read/write failure).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to establish the connection or bind the sockets.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation requires an open connection.
    #[error("Channel not connected")]
    NotConnected,

    /// WebSocket protocol failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Failed to encode or decode a JSON message.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The firmware executed the request and reported an error.
    #[error("Remote error{}: {message}", code.map(|c| format!(" {c}")).unwrap_or_default())]
    Remote {
        /// Error code reported by the firmware host, if any
        code: Option<i64>,
        /// Human-readable error description
        message: String,
    },

    /// Message from the peer doesn't match the expected format.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// No acknowledgement within the configured timeout.
    #[error("Timeout waiting for acknowledgement")]
    Timeout,

    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    Closed,

    /// The stage consumer ended the session.
    #[error("Session ended by consumer")]
    SessionEnded,
}

impl ChannelError {
    /// True for failures scoped to a single call.
    ///
    /// The command is lost but the loop may continue; a broken connection
    /// shows up as [`NotConnected`](Self::NotConnected) on the next call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::Io(_)
                | ChannelError::WebSocket(_)
                | ChannelError::Json(_)
                | ChannelError::Remote { .. }
                | ChannelError::InvalidResponse(_)
                | ChannelError::Timeout
        )
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// How long [`CommandChannel::send_program`] blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Return once the stage has accepted the program
    Acknowledged,
    /// Return only after the commanded motion has physically finished
    WaitForMoves,
}

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Serialized delivery of motion programs to the stage.
///
/// Calls take `&mut self` and block until acknowledged, so one channel never
/// has more than one program in flight.
pub trait CommandChannel {
    /// Open the connection. Failure leaves the channel disconnected.
    fn connect(&mut self) -> ChannelResult<()>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Deliver `program` and block according to `completion`.
    ///
    /// An empty program is a no-op.
    fn send_program(&mut self, program: &MotionProgram, completion: Completion)
        -> ChannelResult<()>;

    /// Close the connection. Calling this on a closed channel is a no-op.
    fn disconnect(&mut self) -> ChannelResult<()>;

    /// Marker the stage side asked to be centered on, if the backend carries one.
    fn requested_marker(&self) -> Option<u32> {
        None
    }
}

impl<C: CommandChannel + ?Sized> CommandChannel for Box<C> {
    fn connect(&mut self) -> ChannelResult<()> {
        (**self).connect()
    }

    fn state(&self) -> ConnectionState {
        (**self).state()
    }

    fn send_program(
        &mut self,
        program: &MotionProgram,
        completion: Completion,
    ) -> ChannelResult<()> {
        (**self).send_program(program, completion)
    }

    fn disconnect(&mut self) -> ChannelResult<()> {
        (**self).disconnect()
    }

    fn requested_marker(&self) -> Option<u32> {
        (**self).requested_marker()
    }
}
