use std::{fmt, io, panic::Location};

use thiserror::Error;
use tracing::debug;

/// Errors reported by connection and stream operations
///
/// Errors fall into two classes. *Normal* errors ([`WantRead`], [`WantWrite`] and
/// [`ZeroReturn`]) are the expected steady-state signals of non-blocking operation and are only
/// reported through the return value and [`ErrorCode`]. All other errors are *non-normal*:
/// besides being returned they leave an [`ErrorRecord`] on the calling thread's
/// [`error_queue`].
///
/// [`WantRead`]: Error::WantRead
/// [`WantWrite`]: Error::WantWrite
/// [`ZeroReturn`]: Error::ZeroReturn
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The operation cannot progress until more data arrives from the network; retry later
    #[error("operation would block waiting for network input")]
    WantRead,
    /// The send buffer is full; retry the write later with the same arguments
    #[error("operation would block waiting for send buffer space")]
    WantWrite,
    /// The peer concluded the stream and all of its data has been read
    #[error("end of stream")]
    ZeroReturn,
    /// The connection is terminating or terminated
    #[error("protocol is shutdown")]
    ProtocolIsShutdown,
    /// A handshake was attempted before an initial peer address was configured
    #[error("remote peer address not set")]
    RemotePeerAddressNotSet,
    /// A handshake was attempted before both network endpoints were configured
    #[error("network endpoint not set")]
    NetEndpointNotSet,
    /// The call does not match how the handle was created or configured
    #[error("passed invalid argument")]
    InvalidArgument,
    /// An all-or-nothing write was retried with a different buffer or length
    #[error("bad write retry")]
    BadWriteRetry,
    /// The requested mode cannot be supported by the configured network endpoints
    #[error("unsupported")]
    Unsupported,
    /// The call is not permitted in the connection's current state
    #[error("should not have been called")]
    ShouldNotHaveBeenCalled,
    /// An internal invariant failed or a collaborator reported a failure
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    /// Whether this is a normal, retryable condition of non-blocking operation
    pub fn is_normal(&self) -> bool {
        matches!(self, Self::WantRead | Self::WantWrite | Self::ZeroReturn)
    }

    /// Whether this error reflects the state of the QUIC protocol rather than local misuse
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::ProtocolIsShutdown)
    }

    /// The code recorded as the connection's last error when this error is raised
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::WantRead => ErrorCode::WantRead,
            Self::WantWrite => ErrorCode::WantWrite,
            Self::ZeroReturn => ErrorCode::ZeroReturn,
            _ => ErrorCode::Failure,
        }
    }

    /// Integer form of a handshake attempt that failed with this error
    ///
    /// `0` for protocol errors, `-1` for everything else. A successful handshake is `1`.
    pub fn handshake_status(&self) -> i32 {
        if self.is_protocol() {
            0
        } else {
            -1
        }
    }
}

impl From<Error> for io::Error {
    fn from(x: Error) -> Self {
        use self::Error::*;
        let kind = match x {
            WantRead | WantWrite => io::ErrorKind::WouldBlock,
            ZeroReturn => io::ErrorKind::UnexpectedEof,
            ProtocolIsShutdown => io::ErrorKind::NotConnected,
            RemotePeerAddressNotSet | NetEndpointNotSet => io::ErrorKind::NotConnected,
            InvalidArgument | BadWriteRetry | ShouldNotHaveBeenCalled => {
                io::ErrorKind::InvalidInput
            }
            Unsupported => io::ErrorKind::Unsupported,
            Internal(_) => io::ErrorKind::Other,
        };
        Self::new(kind, x)
    }
}

/// Retrievable summary of the last operation's outcome on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    /// The last operation succeeded
    #[default]
    None,
    /// See [`Error::WantRead`]
    WantRead,
    /// See [`Error::WantWrite`]
    WantWrite,
    /// See [`Error::ZeroReturn`]
    ZeroReturn,
    /// A non-normal error was raised; details are on the [`error_queue`]
    Failure,
}

/// Structured record of a non-normal error
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// The error that was raised
    pub error: Error,
    /// Where in this crate it was raised
    pub location: &'static Location<'static>,
    /// Optional detail supplied when the error was raised
    pub message: Option<String>,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.error, self.location)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

/// Per-thread queue of [`ErrorRecord`]s left behind by non-normal errors
///
/// Records accumulate in the order they were raised until they are consumed.
pub mod error_queue {
    use std::{cell::RefCell, collections::VecDeque};

    use super::ErrorRecord;

    /// Records beyond this many are discarded oldest-first
    const MAX_RECORDS: usize = 16;

    thread_local! {
        static QUEUE: RefCell<VecDeque<ErrorRecord>> = const { RefCell::new(VecDeque::new()) };
    }

    pub(crate) fn push(record: ErrorRecord) {
        QUEUE.with(|q| {
            let mut q = q.borrow_mut();
            if q.len() == MAX_RECORDS {
                q.pop_front();
            }
            q.push_back(record);
        });
    }

    /// Removes and returns the oldest record
    pub fn pop() -> Option<ErrorRecord> {
        QUEUE.with(|q| q.borrow_mut().pop_front())
    }

    /// Returns the oldest record without removing it
    pub fn peek() -> Option<ErrorRecord> {
        QUEUE.with(|q| q.borrow().front().cloned())
    }

    /// Returns the most recently raised record without removing it
    pub fn peek_last() -> Option<ErrorRecord> {
        QUEUE.with(|q| q.borrow().back().cloned())
    }

    /// Discards every record
    pub fn clear() {
        QUEUE.with(|q| q.borrow_mut().clear());
    }
}

/// Leaves a record for a non-normal error raised at `location`
pub(crate) fn record(error: Error, location: &'static Location<'static>, message: Option<String>) {
    debug_assert!(!error.is_normal());
    debug!(%error, %location, "raised");
    error_queue::push(ErrorRecord {
        error,
        location,
        message,
    });
}

/// Raises an error when no connection is available to record it on
#[track_caller]
pub(crate) fn raise_detached(error: Error) -> Error {
    if !error.is_normal() {
        record(error, Location::caller(), None);
    }
    error
}

/// Like [`raise_detached`] for failures reported by a collaborator
#[track_caller]
pub(crate) fn raise_detached_with(error: Error, detail: impl fmt::Display) -> Error {
    record(error, Location::caller(), Some(detail.to_string()));
    error
}
