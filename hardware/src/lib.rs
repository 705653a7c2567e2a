//! Stage drivers for the marker centering workcell.
//!
//! Every backend implements [`CommandChannel`], which delivers one motion
//! program at a time and blocks until the stage acknowledges it. Backends are
//! feature-gated for optional compilation.
//!
//! # Features
//!
//! - `moonraker` - JSON-RPC over WebSocket to a Klipper host (Moonraker)
//! - `workcell` - Unix socket pair to a consumer embedded in the firmware
//!   process, for firmware that cannot host a network client (sockets are Unix only)

pub mod channel;

#[cfg(feature = "moonraker")]
pub mod moonraker;

#[cfg(feature = "workcell")]
pub mod workcell;

pub use channel::{ChannelError, ChannelResult, CommandChannel, Completion, ConnectionState};
