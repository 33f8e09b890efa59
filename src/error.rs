//! Error types for stream-monitor.
//!
//! Errors are split into two layers:
//! - **Monitor errors** ([`StreamMonitorError`]): returned to callers of
//!   [`StreamMonitor`](crate::StreamMonitor); every failed call reports one.
//! - **Backend errors** ([`BackendError`]): reported by an audio server
//!   backend and wrapped by the monitor with the operation that failed.

use crate::backend::{ContextState, StreamState};
use crate::config::Direction;

/// Errors returned by [`StreamMonitor`](crate::StreamMonitor) operations.
///
/// Messages describe the failed operation only; the backend's own error is
/// reachable through [`std::error::Error::source`].
///
/// A failed `write` or `read` carries no byte count: the call either moved
/// the full length or it failed, and how much was transferred before the
/// failure is unspecified.
#[derive(Debug, thiserror::Error)]
pub enum StreamMonitorError {
    /// The backend could not create a connection to the audio server.
    #[error("failed to connect to audio server")]
    Connect(#[source] BackendError),

    /// The background event loop thread could not be started.
    #[error("failed to spawn event loop thread")]
    EventLoopSpawn(#[source] std::io::Error),

    /// The connection reached a terminal state before becoming ready.
    #[error("connection reached {state} before becoming ready")]
    ConnectionNotReady {
        /// The state the connection ended up in.
        state: ContextState,
    },

    /// The backend could not create a stream on the connection.
    #[error("failed to create stream")]
    CreateStream(#[source] BackendError),

    /// The stream could not be connected for the requested direction.
    #[error("failed to connect {direction} stream")]
    ConnectStream {
        /// Direction the stream was being connected for.
        direction: Direction,
        /// The underlying backend error.
        #[source]
        source: BackendError,
    },

    /// The stream reached a terminal state before becoming ready.
    #[error("stream reached {state} before becoming ready")]
    StreamNotReady {
        /// The state the stream ended up in.
        state: StreamState,
    },

    /// The server reported an invalid writable size.
    #[error("writable size query returned an invalid value")]
    InvalidWritableSize,

    /// Submitting data to the stream failed.
    #[error("failed to write {len} bytes")]
    Write {
        /// Size of the rejected submission.
        len: usize,
        /// The underlying backend error.
        #[source]
        source: BackendError,
    },

    /// Peeking at the next captured fragment failed.
    #[error("failed to peek captured data")]
    Peek(#[source] BackendError),

    /// Releasing a peeked fragment failed.
    #[error("failed to discard captured fragment")]
    Discard(#[source] BackendError),

    /// The stream reported data but exposed no fragment to read it from.
    #[error("peeked fragment is no longer available")]
    MissingFragment,

    /// The connection or stream failed while the caller was waiting.
    #[error("stream failed")]
    Failed(#[source] BackendError),

    /// The connection or stream left its good states without failing,
    /// typically because it was terminated.
    #[error("stream is in a bad state")]
    BadState,

    /// The background event loop exited, so no further progress is possible.
    #[error("event loop stopped")]
    EventLoopStopped,

    /// The operation does not apply to the monitor's direction.
    #[error("operation not supported on a {direction} stream")]
    WrongDirection {
        /// Direction the monitor was created with.
        direction: Direction,
    },
}

/// Error code used when a backend has no more specific code to report.
pub const ERR_UNKNOWN: i32 = -1;

/// An error reported by an audio server backend.
///
/// Carries the server's numeric error code alongside a human-readable
/// message, mirroring how audio servers report their last error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct BackendError {
    code: i32,
    message: String,
}

impl BackendError {
    /// Creates a backend error with an explicit server error code.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates a backend error without a specific error code.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(ERR_UNKNOWN, message)
    }

    /// Returns the server error code.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::new(3, "connection refused");
        assert_eq!(err.to_string(), "connection refused (code 3)");
        assert_eq!(err.code(), 3);
        assert_eq!(err.message(), "connection refused");
    }

    #[test]
    fn test_backend_error_msg_uses_unknown_code() {
        let err = BackendError::msg("boom");
        assert_eq!(err.code(), ERR_UNKNOWN);
    }

    #[test]
    fn test_monitor_error_display() {
        let err = StreamMonitorError::ConnectionNotReady {
            state: ContextState::Failed,
        };
        assert_eq!(
            err.to_string(),
            "connection reached failed before becoming ready"
        );

        let err = StreamMonitorError::WrongDirection {
            direction: Direction::Capture,
        };
        assert_eq!(err.to_string(), "operation not supported on a capture stream");
    }

    #[test]
    fn test_monitor_error_source_chain() {
        use std::error::Error;

        let err = StreamMonitorError::Write {
            len: 512,
            source: BackendError::msg("too large"),
        };
        assert_eq!(err.to_string(), "failed to write 512 bytes");
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("too large (code -1)"));
    }
}
