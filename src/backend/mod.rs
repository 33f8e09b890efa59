//! Audio server backend abstraction.
//!
//! A backend is the callback-driven side of the bridge: it owns the server
//! connection and its streams, and reports everything that happens to them as
//! [`Notification`]s. The [`StreamMonitor`](crate::StreamMonitor) drives a
//! backend from its event loop thread:
//!
//! 1. [`EventPoll::wait`] blocks (without the monitor lock) until the backend
//!    has activity or the poll interval elapses.
//! 2. [`Connection::dispatch`] runs with the monitor lock held and returns the
//!    notifications that became pending since the last dispatch.
//!
//! All other [`Connection`] and [`ServerStream`] methods are only ever called
//! with the monitor lock held.

#[cfg(feature = "cpal")]
mod device;
pub mod loopback;
mod queue;

#[cfg(feature = "cpal")]
pub use device::{CpalBackend, CpalConnection, CpalStream};
pub use loopback::{LoopbackConfig, LoopbackServer, ServerStats};
pub use queue::{NotificationQueue, PollWaker, QueuePoll};

use std::fmt;
use std::time::Duration;

use crate::config::{Direction, SampleSpec, StreamFlags};
use crate::BackendError;

/// State of a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Not connected yet.
    Unconnected,
    /// Establishing the transport.
    Connecting,
    /// Authenticating with the server.
    Authorizing,
    /// Announcing the client name.
    SettingName,
    /// Connected and usable.
    Ready,
    /// The connection failed; see [`Connection::last_error`].
    Failed,
    /// The connection was closed cleanly.
    Terminated,
}

impl ContextState {
    /// Returns `true` for states from which the connection can still become
    /// or remain usable.
    #[must_use]
    pub fn is_good(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Authorizing | Self::SettingName | Self::Ready
        )
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Authorizing => "authorizing",
            Self::SettingName => "setting name",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        })
    }
}

/// State of a server stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Created but not connected.
    Unconnected,
    /// Being set up on the server.
    Creating,
    /// Established and usable.
    Ready,
    /// The stream failed.
    Failed,
    /// The stream was closed cleanly.
    Terminated,
}

impl StreamState {
    /// Returns `true` for states from which the stream can still become or
    /// remain usable.
    #[must_use]
    pub fn is_good(self) -> bool {
        matches!(self, Self::Creating | Self::Ready)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unconnected => "unconnected",
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        })
    }
}

/// Something that happened on the server side.
///
/// Notifications are the backend's callbacks: the monitor dispatches each one
/// with its lock held, and dispatching only ever wakes blocked callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The connection moved to a new state.
    ContextState(ContextState),
    /// The stream moved to a new state.
    StreamState(StreamState),
    /// The server can accept more playback data.
    WriteReady {
        /// Bytes the server requested.
        bytes: usize,
    },
    /// Captured data arrived.
    ReadReady {
        /// Bytes now available.
        bytes: usize,
    },
    /// Timing information was updated.
    LatencyUpdate,
}

/// Result of peeking at the next captured fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peek {
    /// Nothing is available yet.
    Empty,
    /// A gap in the stream of the given length, with no data behind it.
    ///
    /// The length is never zero. Holes must still be discarded before the
    /// next fragment can be peeked.
    Hole(usize),
    /// A fragment of the given length; read it through
    /// [`ServerStream::peeked`].
    ///
    /// The length is never zero; a backend with nothing to hand out reports
    /// [`Peek::Empty`] instead.
    Data(usize),
}

/// An audio server the monitor can connect to.
pub trait AudioBackend {
    /// Connection handle type.
    type Connection: Connection;
    /// Event source driving the connection.
    type Poll: EventPoll;

    /// Starts connecting to `server` (or the default server) as
    /// `client_name`.
    ///
    /// The returned connection is typically still [`ContextState::Connecting`];
    /// it becomes ready through notifications dispatched by the event loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be created at all.
    fn connect(
        &self,
        server: Option<&str>,
        client_name: &str,
    ) -> Result<(Self::Connection, Self::Poll), BackendError>;
}

/// A connection to an audio server.
///
/// Dropping the connection releases it.
pub trait Connection: Send + 'static {
    /// Stream handle type.
    type Stream: ServerStream;

    /// Returns the current connection state.
    fn state(&self) -> ContextState;

    /// Returns the last error the server reported on this connection.
    fn last_error(&self) -> BackendError;

    /// Creates an unconnected stream with the given sample spec.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the stream.
    fn create_stream(
        &mut self,
        name: &str,
        spec: &SampleSpec,
    ) -> Result<Self::Stream, BackendError>;

    /// Processes pending server activity and returns the resulting
    /// notifications, for the connection and all of its streams.
    fn dispatch(&mut self) -> Vec<Notification>;

    /// Closes the connection. Streams created on it stop being usable.
    fn disconnect(&mut self);
}

/// A playback or capture stream on a [`Connection`].
///
/// Dropping the stream releases it.
pub trait ServerStream: Send + 'static {
    /// Returns the current stream state.
    fn state(&self) -> StreamState;

    /// Connects the stream for playback or capture.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be connected.
    fn connect(&mut self, direction: Direction, flags: StreamFlags) -> Result<(), BackendError>;

    /// Returns how many bytes can be written without blocking, or `None` if
    /// the server cannot tell (for example because the stream is not ready).
    fn writable_size(&self) -> Option<usize>;

    /// Submits playback data. Callers never submit more than
    /// [`writable_size`](Self::writable_size) bytes at once.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the data.
    fn write(&mut self, data: &[u8]) -> Result<(), BackendError>;

    /// Peeks at the next captured fragment without consuming it.
    ///
    /// Peeking again before [`discard`](Self::discard) returns the same
    /// fragment.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be read from.
    fn peek(&mut self) -> Result<Peek, BackendError>;

    /// Borrows the data of the currently peeked fragment.
    ///
    /// The fragment stays owned by the backend until it is discarded.
    fn peeked(&self) -> Option<&[u8]>;

    /// Releases the currently peeked fragment (or hole).
    ///
    /// # Errors
    ///
    /// Returns an error if nothing was peeked or the server refuses.
    fn discard(&mut self) -> Result<(), BackendError>;
}

/// Event source that tells the event loop when to dispatch.
pub trait EventPoll: Send + 'static {
    /// Blocks until the backend has activity, the poll is woken, or `timeout`
    /// elapses. Returning early is always allowed.
    ///
    /// # Errors
    ///
    /// Returns an error if the event source broke; the event loop stops.
    fn wait(&mut self, timeout: Duration) -> Result<(), BackendError>;

    /// Returns a handle that interrupts [`wait`](Self::wait) from another
    /// thread.
    fn waker(&self) -> PollWaker;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_state_is_good() {
        assert!(!ContextState::Unconnected.is_good());
        assert!(ContextState::Connecting.is_good());
        assert!(ContextState::Authorizing.is_good());
        assert!(ContextState::SettingName.is_good());
        assert!(ContextState::Ready.is_good());
        assert!(!ContextState::Failed.is_good());
        assert!(!ContextState::Terminated.is_good());
    }

    #[test]
    fn test_stream_state_is_good() {
        assert!(!StreamState::Unconnected.is_good());
        assert!(StreamState::Creating.is_good());
        assert!(StreamState::Ready.is_good());
        assert!(!StreamState::Failed.is_good());
        assert!(!StreamState::Terminated.is_good());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ContextState::SettingName.to_string(), "setting name");
        assert_eq!(StreamState::Terminated.to_string(), "terminated");
    }
}
