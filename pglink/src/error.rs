//! `pglink` error types.
use std::{backtrace::Backtrace, borrow::Cow, fmt, io, str::Utf8Error};

use crate::{
    connection::{AuthError, ParseError, SequenceError},
    copy::CopyNotSupported,
    fetch::EmptyQueryError,
    postgres::{ErrorResponse, ProtocolError},
    row::DecodeError,
    statement::InvalidRowLimit,
    types::CodecError,
};

/// A specialized [`Result`] type for `pglink` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pglink` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// The server error, when the statement failed server-side.
    pub fn as_db(&self) -> Option<&ErrorResponse> {
        match &self.kind {
            ErrorKind::Database(db) => Some(db),
            _ => None,
        }
    }

    /// Returns `true` if the statement failed because a cancel request
    /// took effect (SQLSTATE 57014).
    pub fn is_query_canceled(&self) -> bool {
        self.as_db().is_some_and(ErrorResponse::is_query_canceled)
    }

    /// Returns `true` for errors that are fatal to the connection:
    /// protocol violations and transport failures.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Protocol(_) | ErrorKind::Io(_))
    }

    pub(crate) fn invalid_parameter(reason: impl Into<Cow<'static, str>>) -> Error {
        InvalidParameter { reason: reason.into() }.into()
    }
}

/// All possible error kind from `pglink` library.
pub enum ErrorKind {
    Config(ParseError),
    Protocol(ProtocolError),
    Io(io::Error),
    Database(ErrorResponse),
    Codec(CodecError),
    Decode(DecodeError),
    Auth(AuthError),
    InvalidParameter(InvalidParameter),
    Sequence(SequenceError),
    CopyNotSupported(CopyNotSupported),
    EmptyQuery(EmptyQueryError),
    Utf8(Utf8Error),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<std::io::Error>e => ErrorKind::Io(e));
from!(<ErrorResponse>e => ErrorKind::Database(e));
from!(<CodecError>e => ErrorKind::Codec(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<InvalidParameter>e => ErrorKind::InvalidParameter(e));
from!(<InvalidRowLimit>e => ErrorKind::InvalidParameter(InvalidParameter { reason: e.to_string().into() }));
from!(<SequenceError>e => ErrorKind::Sequence(e));
from!(<CopyNotSupported>e => ErrorKind::CopyNotSupported(e));
from!(<EmptyQueryError>e => ErrorKind::EmptyQuery(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));
from!(<AuthError>e => ErrorKind::Auth(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Codec(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::Auth(e) => e.fmt(f),
            Self::InvalidParameter(e) => e.fmt(f),
            Self::Sequence(e) => e.fmt(f),
            Self::CopyNotSupported(e) => e.fmt(f),
            Self::EmptyQuery(e) => e.fmt(f),
            Self::Utf8(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// An argument was rejected locally, before any message went to the wire.
///
/// The connection state is unaffected.
pub struct InvalidParameter {
    pub(crate) reason: Cow<'static, str>,
}

impl std::error::Error for InvalidParameter { }

impl fmt::Display for InvalidParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid parameter: {}", self.reason)
    }
}

impl fmt::Debug for InvalidParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
