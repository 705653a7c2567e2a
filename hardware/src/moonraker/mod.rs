//! Moonraker JSON-RPC backend.
//!
//! Drives a Klipper printer through Moonraker's WebSocket API by submitting
//! each motion program as a `printer.gcode.script` call.

pub mod channel;
pub mod client;
pub mod rpc;

pub use channel::MoonrakerChannel;
pub use client::MoonrakerClient;
