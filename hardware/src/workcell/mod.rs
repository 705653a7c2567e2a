//! Workcell IPC backend.
//!
//! For firmware that can only *pull* work from inside its own timer loop. Two
//! Unix sockets connect the processes:
//!
//! - command socket (datagram, bound by the firmware consumer): the controller
//!   pushes one G-code line or `DONE` per datagram
//! - control socket (stream, bound by the controller): the consumer connects,
//!   writes one `START <id>` or `REQUEST <id>`, and disconnects
//!
//! The controller never sends a command until the consumer has asked for one,
//! so a busy toolhead is never handed work it cannot execute yet.

pub mod busy_gate;
pub mod protocol;
pub mod sim;

#[cfg(unix)]
pub mod channel;
#[cfg(unix)]
pub mod consumer;
#[cfg(unix)]
pub mod link;

pub use busy_gate::{BusyGate, MotionExecutor, PollBackoff, ToolheadStatus};
pub use protocol::{CommandMessage, Handshake, ProtocolError};
pub use sim::SimulatedToolhead;

#[cfg(unix)]
pub use channel::WorkcellChannel;
#[cfg(unix)]
pub use consumer::{Tick, TickOutcome, WorkcellConsumer};
#[cfg(unix)]
pub use link::WorkcellLink;

/// Mode for both socket files so the firmware user can reach them
#[cfg(unix)]
pub const SOCKET_MODE: u32 = 0o666;

/// Remove a socket file left behind by a previous run.
///
/// Refuses to delete anything that is not a socket.
#[cfg(unix)]
pub(crate) fn remove_stale_socket(path: &std::path::Path) -> std::io::Result<()> {
    use std::io;
    use std::os::unix::fs::FileTypeExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("path {} exists but is not a socket", path.display()),
        ));
    }

    tracing::debug!("Removing stale socket {}", path.display());
    std::fs::remove_file(path)
}

#[cfg(unix)]
pub(crate) fn set_socket_permissions(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
}

/// Remove a socket file we bound, ignoring a file that is already gone.
#[cfg(unix)]
pub(crate) fn unlink_socket(path: &std::path::Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove socket {}: {e}", path.display()),
    }
}
