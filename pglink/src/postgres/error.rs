//! Protocol error
use std::fmt;

use super::BackendMessage;

/// An error when translating buffer from postgres.
///
/// Once a message boundary is lost it cannot be safely rediscovered,
/// so any of these is fatal to the connection.
pub enum ProtocolError {
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    UnknownAuth {
        auth: u32,
    },
    /// Message body ended before the declared length.
    Truncated {
        msgtype: u8,
    },
    /// Declared message length is inconsistent (below the 4 byte minimum).
    Length {
        msgtype: u8,
        len: i32,
    },
    /// Postgres string field is not valid utf8 or missing nul termination.
    Corrupt {
        msgtype: u8,
    },
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ProtocolError::Unexpected { expect, found, phase } => {
                let found = BackendMessage::message_name(found);
                match expect {
                    Some(m) => write!(
                        f,
                        "expected message `{}` found `{found}`",
                        BackendMessage::message_name(m),
                    )?,
                    None => write!(f, "unexpected message `{found}`")?,
                }
                if let Some(phase) = phase {
                    write!(f, " in `{phase}`")?
                }
                Ok(())
            },
            ProtocolError::UnknownAuth { auth } => {
                write!(f, "unknown authentication method code ({auth})")
            },
            ProtocolError::Truncated { msgtype } => write!(
                f,
                "message `{}` body ended before its declared length",
                BackendMessage::message_name(msgtype),
            ),
            ProtocolError::Length { msgtype, len } => write!(
                f,
                "message `{}` declared an invalid length ({len})",
                BackendMessage::message_name(msgtype),
            ),
            ProtocolError::Corrupt { msgtype } => write!(
                f,
                "message `{}` contains a corrupt string field",
                BackendMessage::message_name(msgtype),
            ),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: None }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected { expect: Some(expect), found, phase: None }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: Some(phase) }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn truncated(msgtype: u8) -> ProtocolError {
        Self::Truncated { msgtype }
    }

    pub(crate) fn length(msgtype: u8, len: i32) -> ProtocolError {
        Self::Length { msgtype, len }
    }

    pub(crate) fn corrupt(msgtype: u8) -> ProtocolError {
        Self::Corrupt { msgtype }
    }
}
