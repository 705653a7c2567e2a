//! Text messages exchanged over the workcell sockets.
//!
//! The consumer announces itself on the control stream socket with
//! `START <marker_id>` and asks for work with `REQUEST <marker_id>`. The
//! controller answers on the command datagram socket with one G-code line per
//! datagram, or `DONE` to end the session.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Terminal sentinel sent on the command socket.
pub const DONE: &str = "DONE";

/// Largest message either side reads in one go.
pub const MAX_MESSAGE_LEN: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    #[error("Expected '<KIND> <marker_id>', got {0:?}")]
    Malformed(String),

    #[error("Invalid marker id {0:?}")]
    InvalidMarkerId(String),

    #[error("Message is not UTF-8")]
    NotUtf8,
}

/// Message a consumer writes to the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Begin a session centering on the given marker
    Start(u32),
    /// Consumer is idle and ready for the next command
    Request(u32),
}

impl Handshake {
    pub fn marker_id(&self) -> u32 {
        match self {
            Handshake::Start(id) | Handshake::Request(id) => *id,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::NotUtf8)?
            .parse()
    }
}

impl FromStr for Handshake {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut tokens = trimmed.split_whitespace();

        let kind = tokens.next().ok_or(ProtocolError::Empty)?;
        let (Some(id), None) = (tokens.next(), tokens.next()) else {
            return Err(ProtocolError::Malformed(trimmed.to_string()));
        };
        let id: u32 = id
            .parse()
            .map_err(|_| ProtocolError::InvalidMarkerId(id.to_string()))?;

        match kind {
            "START" => Ok(Handshake::Start(id)),
            "REQUEST" => Ok(Handshake::Request(id)),
            other => Err(ProtocolError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Handshake::Start(id) => write!(f, "START {id}"),
            Handshake::Request(id) => write!(f, "REQUEST {id}"),
        }
    }
}

/// Message the controller writes to the command socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandMessage {
    Done,
    Script(String),
}

impl CommandMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ProtocolError::Empty);
        }
        if text == DONE {
            Ok(CommandMessage::Done)
        } else {
            Ok(CommandMessage::Script(text.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CommandMessage::Done => DONE,
            CommandMessage::Script(script) => script,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_parse() {
        assert_eq!("START 7".parse::<Handshake>(), Ok(Handshake::Start(7)));
        assert_eq!("REQUEST 7\n".parse::<Handshake>(), Ok(Handshake::Request(7)));
        assert_eq!(Handshake::Start(12).to_string(), "START 12");
    }

    #[test]
    fn test_handshake_rejects_bad_shapes() {
        assert_eq!("".parse::<Handshake>(), Err(ProtocolError::Empty));
        assert!(matches!(
            "START".parse::<Handshake>(),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            "START 1 2".parse::<Handshake>(),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            "START seven".parse::<Handshake>(),
            Err(ProtocolError::InvalidMarkerId(_))
        ));
        assert!(matches!(
            "HELLO 7".parse::<Handshake>(),
            Err(ProtocolError::UnknownKind(_))
        ));
        assert_eq!(
            Handshake::from_bytes(&[0xff, 0xfe]),
            Err(ProtocolError::NotUtf8)
        );
    }

    #[test]
    fn test_command_message() {
        assert_eq!(CommandMessage::from_bytes(b"DONE"), Ok(CommandMessage::Done));
        assert_eq!(
            CommandMessage::from_bytes(b"G1 X-0.5"),
            Ok(CommandMessage::Script("G1 X-0.5".to_string()))
        );
        assert_eq!(CommandMessage::from_bytes(b"  "), Err(ProtocolError::Empty));
        assert_eq!(CommandMessage::Done.as_str(), "DONE");
    }
}
