//! Dispatcher error taxonomy
//!
//! Short reads are deliberately absent: a read that stops at end-of-file is
//! a successful [`ReadOutcome`](super::ReadOutcome) with fewer bytes than
//! requested, never an error.

use std::io;
use thiserror::Error;

/// Why a generation stopped waiting for its sub-tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A [`CancelToken`](super::CancelToken) fired
    Requested,
    /// The read deadline passed
    DeadlineExpired,
    /// The dispatcher is shutting down
    Shutdown,
}

/// Failure of a dispatched read
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The positioned read of one sub-task failed
    ///
    /// When several sub-tasks fail, this is the one with the lowest index.
    #[error("sub-read {index} at offset {offset} failed: {source}")]
    Io {
        index: usize,
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// The request was cancelled before all sub-tasks ran
    #[error("read cancelled")]
    Cancelled,

    /// The request deadline expired before all sub-tasks ran
    #[error("read timed out")]
    TimedOut,

    /// The dispatcher has been shut down
    #[error("dispatcher is shut down")]
    Shutdown,

    /// The request cannot be expressed as a positioned read
    #[error("invalid read request: {0}")]
    InvalidRequest(String),
}

impl DispatchError {
    /// OS error code for the negated-errno calling convention
    pub fn errno(&self) -> i32 {
        match self {
            DispatchError::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            DispatchError::Cancelled => libc::EINTR,
            DispatchError::TimedOut => libc::ETIMEDOUT,
            DispatchError::Shutdown => libc::ESHUTDOWN,
            DispatchError::InvalidRequest(_) => libc::EINVAL,
        }
    }

    pub(crate) fn from_cancel(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Requested => DispatchError::Cancelled,
            CancelReason::DeadlineExpired => DispatchError::TimedOut,
            CancelReason::Shutdown => DispatchError::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let io = DispatchError::Io {
            index: 2,
            offset: 4096,
            source: io::Error::from_raw_os_error(libc::EBADF),
        };
        assert_eq!(io.errno(), libc::EBADF);

        let opaque = DispatchError::Io {
            index: 0,
            offset: 0,
            source: io::Error::new(io::ErrorKind::Other, "no errno"),
        };
        assert_eq!(opaque.errno(), libc::EIO);

        assert_eq!(DispatchError::Cancelled.errno(), libc::EINTR);
        assert_eq!(DispatchError::TimedOut.errno(), libc::ETIMEDOUT);
        assert_eq!(DispatchError::Shutdown.errno(), libc::ESHUTDOWN);
        assert_eq!(DispatchError::InvalidRequest("x".into()).errno(), libc::EINVAL);
    }

    #[test]
    fn test_display_names_sub_read() {
        let err = DispatchError::Io {
            index: 3,
            offset: 12288,
            source: io::Error::from_raw_os_error(libc::EIO),
        };
        let msg = err.to_string();
        assert!(msg.contains("sub-read 3"));
        assert!(msg.contains("12288"));
    }

    #[test]
    fn test_cancel_reason_mapping() {
        assert!(matches!(
            DispatchError::from_cancel(CancelReason::Requested),
            DispatchError::Cancelled
        ));
        assert!(matches!(
            DispatchError::from_cancel(CancelReason::DeadlineExpired),
            DispatchError::TimedOut
        ));
        assert!(matches!(
            DispatchError::from_cancel(CancelReason::Shutdown),
            DispatchError::Shutdown
        ));
    }
}
