//! Error types for channel and segment operations.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Errors from segment and channel operations.
#[derive(Debug)]
pub enum Error {
    /// A caller-supplied value was rejected (bad name, shrinking resize,
    /// file smaller than the requested capacity, malformed string payload).
    InvalidArgument(String),
    /// `create` found a file already present at the target path.
    AlreadyExists(PathBuf),
    /// The control block was written by an incompatible protocol version.
    VersionMismatch {
        /// Version this build speaks.
        expected: i32,
        /// Version found in the control block.
        found: i32,
    },
    /// The peer did not hand the turn back within the configured timeout.
    Timeout(Duration),
    /// The peer set the closed flag.
    PeerClosed,
    /// An access fell outside the mapped segment.
    OutOfBounds {
        /// First byte of the attempted access.
        offset: usize,
        /// Length of the attempted access.
        len: usize,
        /// Size of the segment.
        capacity: usize,
    },
    /// The segment or channel has already been closed.
    Closed,
    /// I/O error from the filesystem or the mapping.
    Io(io::Error),
}

/// Payload-free discriminant of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    AlreadyExists,
    VersionMismatch,
    Timeout,
    PeerClosed,
    OutOfBounds,
    Closed,
    IoFailure,
}

impl Error {
    /// Get the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::PeerClosed => ErrorKind::PeerClosed,
            Self::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            Self::Closed => ErrorKind::Closed,
            Self::Io(_) => ErrorKind::IoFailure,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Self::AlreadyExists(path) => write!(f, "{} already exists", path.display()),
            Self::VersionMismatch { expected, found } => write!(
                f,
                "incompatible protocol versions (expected v{}, found v{})",
                expected, found
            ),
            Self::Timeout(after) => {
                write!(f, "peer did not return control within {:?}", after)
            }
            Self::PeerClosed => write!(f, "peer closed the channel"),
            Self::OutOfBounds {
                offset,
                len,
                capacity,
            } => write!(
                f,
                "access of {} bytes at offset {} is outside a {}-byte segment",
                len, offset, capacity
            ),
            Self::Closed => write!(f, "segment is closed"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
