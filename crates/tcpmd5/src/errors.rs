//! Error types for TCP MD5 key access
//!
//! Every failure maps to one of three kinds: invalid argument, illegal state
//! or I/O failure. Host adapters translate [`ErrorKind`] into whatever
//! signalling convention they use.

use std::fmt;
use std::io;
use thiserror::Error;

/// Native call that produced an I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeOp {
    Socket,
    Getsockopt,
    Setsockopt,
    Getsockname,
    Bind,
    Listen,
    Connect,
}

impl NativeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            NativeOp::Socket => "socket",
            NativeOp::Getsockopt => "getsockopt",
            NativeOp::Setsockopt => "setsockopt",
            NativeOp::Getsockname => "getsockname",
            NativeOp::Bind => "bind",
            NativeOp::Listen => "listen",
            NativeOp::Connect => "connect",
        }
    }
}

impl fmt::Display for NativeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse error category exposed to host adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    IllegalState,
    Io,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("illegal state: {message}")]
    IllegalState { message: String },

    #[error("{op} failed: {source}")]
    Io {
        op: NativeOp,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::IllegalState { .. } => ErrorKind::IllegalState,
            Error::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState {
            message: message.into(),
        }
    }

    /// Wrap an OS error together with the call that raised it.
    pub fn io(op: NativeOp, source: io::Error) -> Self {
        Error::Io { op, source }
    }

    /// Key longer than a limit. Names both the supplied length and the limit.
    pub(crate) fn key_too_long(len: usize, limit: usize) -> Self {
        Error::invalid_argument(format!(
            "key length {} exceeds maximum of {} bytes",
            len, limit
        ))
    }

    /// Handle whose runtime type matches no registered shape. `registered`
    /// lists the shapes that were tried.
    pub(crate) fn unknown_handle(registered: &str) -> Self {
        Error::illegal_state(format!(
            "handle does not match any registered shape (registered: {})",
            registered
        ))
    }

    /// Handle matched a shape but its descriptor could not be read.
    pub(crate) fn unreadable_descriptor(shape: &str) -> Self {
        Error::illegal_state(format!(
            "descriptor field of {} handle could not be read",
            shape
        ))
    }

    /// Raw OS error code, when this is an I/O failure carrying one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure to add a shape to the handle registry. Never fatal on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("handle shape {name} is not available: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("handle shape {name} is already registered")]
    Duplicate { name: String },

    #[error("out of memory while registering handle shape {name}")]
    OutOfMemory { name: String },
}
