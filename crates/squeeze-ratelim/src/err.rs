//! Error types for throttled streams.

use std::io::{Error as IoError, ErrorKind};

/// A throttled operation could not be serviced before its deadline.
///
/// This error is retryable: the connection is still usable, and the owed
/// delay stays recorded on the stream, so retrying the same operation once
/// the delay has elapsed will succeed. It reaches callers as the source of
/// an [`IoError`] with kind [`ErrorKind::TimedOut`].
#[derive(Clone, Copy, Debug, Default, thiserror::Error)]
#[error("bandwidth reservation could not be serviced before the deadline")]
#[non_exhaustive]
pub struct ThrottleTimedOut;

impl ThrottleTimedOut {
    /// Whether the failed operation may be retried. Always true; a deadline
    /// expiry never tears the stream down.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// The stream was shut down while an operation was running or waiting.
///
/// This error is terminal: every later operation on the same stream fails
/// the same way. It reaches callers as the source of an [`IoError`] with
/// kind [`ErrorKind::BrokenPipe`].
#[derive(Clone, Copy, Debug, Default, thiserror::Error)]
#[error("stream was shut down")]
#[non_exhaustive]
pub struct StreamClosed;

/// Build the `io::Error` for a deadline expiry during a throttle wait.
pub(crate) fn throttle_timeout() -> IoError {
    IoError::new(ErrorKind::TimedOut, ThrottleTimedOut)
}

/// Build the `io::Error` for an operation interrupted by shutdown.
pub(crate) fn stream_closed() -> IoError {
    IoError::new(ErrorKind::BrokenPipe, StreamClosed)
}
