use std::fmt;
use std::io;

/// Errors surfaced by the dispatcher, the reactor, and completion operations.
///
/// Operation completions canonicalize raw platform codes into the first two
/// variants before the upcall; everything else crosses the boundary wrapped
/// in its system category as `Io`.
#[derive(Debug)]
pub enum Error {
    /// A connection was aborted before the accept could be delivered.
    ConnectionAborted,
    /// The platform produced data outside the bounds the caller can hold
    /// (e.g. a peer address larger than the endpoint's capacity).
    InvalidArgument,
    /// A platform I/O error, wrapped with its system category.
    Io(io::Error),
    /// Reactor setup failed (poll/waker creation or registration).
    ReactorSetup(String),
    /// A worker thread panicked inside `run`.
    WorkerPanicked(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectionAborted => write!(f, "connection aborted"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::ReactorSetup(msg) => write!(f, "reactor setup: {msg}"),
            Error::WorkerPanicked(msg) => write!(f, "worker panicked: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl Error {
    /// Map a raw OS error code to the canonical taxonomy.
    pub fn from_raw_os(code: i32) -> Error {
        match code {
            libc::ECONNABORTED => Error::ConnectionAborted,
            libc::EINVAL => Error::InvalidArgument,
            _ => Error::Io(io::Error::from_raw_os_error(code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_os_canonical() {
        assert!(matches!(
            Error::from_raw_os(libc::ECONNABORTED),
            Error::ConnectionAborted
        ));
        assert!(matches!(
            Error::from_raw_os(libc::EINVAL),
            Error::InvalidArgument
        ));
        assert!(matches!(Error::from_raw_os(libc::EIO), Error::Io(_)));
    }

    #[test]
    fn test_io_source() {
        use std::error::Error as _;
        let e = Error::Io(io::Error::from_raw_os_error(libc::EIO));
        assert!(e.source().is_some());
        assert!(Error::ConnectionAborted.source().is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Error::ConnectionAborted), "connection aborted");
        assert_eq!(format!("{}", Error::InvalidArgument), "invalid argument");
    }
}
