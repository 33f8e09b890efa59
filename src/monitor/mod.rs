//! Blocking read/write adapter over a callback-driven stream.
//!
//! A [`StreamMonitor`] pairs one backend connection and stream with a
//! background event loop thread. Callers block on the monitor's condition
//! variable until the event loop reports that the stream can make progress,
//! so straight-line code can `write` and `read` whole buffers.

mod event_loop;
mod staging;

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::backend::{AudioBackend, Connection, ContextState, Peek, ServerStream, StreamState};
use crate::config::{Direction, MonitorConfig, SAMPLE_SPEC, STREAM_FLAGS};
use crate::error::{BackendError, StreamMonitorError};

use event_loop::EventLoop;
use staging::StagedChunk;

/// State shared between callers and the event loop thread.
pub(crate) struct Shared<C: Connection> {
    pub(crate) state: Mutex<MonitorState<C>>,
    pub(crate) ready: Condvar,
}

impl<C: Connection> Shared<C> {
    fn new(connection: C) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                connection: Some(connection),
                stream: None,
                staged: None,
                loop_alive: true,
            }),
            ready: Condvar::new(),
        }
    }
}

/// Everything guarded by the monitor lock.
pub(crate) struct MonitorState<C: Connection> {
    pub(crate) connection: Option<C>,
    stream: Option<C::Stream>,
    staged: Option<StagedChunk>,
    pub(crate) loop_alive: bool,
}

impl<C: Connection> MonitorState<C> {
    fn stream(&self) -> Result<&C::Stream, StreamMonitorError> {
        self.stream.as_ref().ok_or(StreamMonitorError::BadState)
    }

    fn stream_mut(&mut self) -> Result<&mut C::Stream, StreamMonitorError> {
        self.stream.as_mut().ok_or(StreamMonitorError::BadState)
    }

    fn context_state(&self) -> Option<ContextState> {
        self.connection.as_ref().map(Connection::state)
    }

    fn stream_state(&self) -> Option<StreamState> {
        self.stream.as_ref().map(ServerStream::state)
    }

    /// Whether both the connection and the stream are still in good states
    /// and the event loop is still running.
    fn is_stream_healthy(&self) -> bool {
        self.loop_alive
            && self.context_state().is_some_and(ContextState::is_good)
            && self.stream_state().is_some_and(StreamState::is_good)
    }

    /// Checked after every wake-up by both `write` and `read`.
    fn ensure_healthy(&self) -> Result<(), StreamMonitorError> {
        if self.is_stream_healthy() {
            return Ok(());
        }

        let context = self.context_state();
        let stream = self.stream_state();
        if context == Some(ContextState::Failed) || stream == Some(StreamState::Failed) {
            let error = self.connection.as_ref().map_or_else(
                || BackendError::msg("connection released"),
                Connection::last_error,
            );
            tracing::error!(%error, ?context, ?stream, "stream failed");
            return Err(StreamMonitorError::Failed(error));
        }
        if !self.loop_alive && context.is_some_and(ContextState::is_good) {
            tracing::error!("event loop is no longer running");
            return Err(StreamMonitorError::EventLoopStopped);
        }

        tracing::warn!(?context, ?stream, "stream in bad state");
        Err(StreamMonitorError::BadState)
    }
}

/// A blocking, thread-safe view of one playback or capture stream.
///
/// `write` and `read` take `&self`, so a monitor can be shared between
/// threads (for example in an `Arc`). Calls are serialized by the monitor
/// lock; running one writer and one reader concurrently is fine, but
/// several writers (or readers) interleave their data unpredictably.
///
/// # Lifecycle
///
/// 1. Created by [`create`](Self::create) once the connection and the stream
///    are ready
/// 2. `write` (playback) or `read` (capture) block until done or failed
/// 3. [`destroy`](Self::destroy) stops the event loop and releases the
///    stream and the connection; dropping the monitor does the same
///
/// # Example
///
/// ```
/// use stream_monitor::{Direction, LoopbackServer, StreamMonitor};
///
/// let server = LoopbackServer::default();
/// let monitor = StreamMonitor::create(&server, Direction::Playback)?;
///
/// monitor.write(&[0u8; 4096])?;
/// monitor.destroy();
/// # Ok::<(), stream_monitor::StreamMonitorError>(())
/// ```
pub struct StreamMonitor<B: AudioBackend> {
    direction: Direction,
    shared: Arc<Shared<B::Connection>>,
    event_loop: Option<EventLoop>,
    _backend: PhantomData<fn() -> B>,
}

impl<B: AudioBackend> StreamMonitor<B> {
    /// Connects to the backend's default server and sets up a stream for
    /// `direction`.
    ///
    /// Blocks until the connection and the stream are ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the stream cannot be created, or
    /// if either one fails or terminates before becoming ready. Everything
    /// acquired up to that point is released first.
    pub fn create(backend: &B, direction: Direction) -> Result<Self, StreamMonitorError> {
        Self::create_with_config(backend, direction, &MonitorConfig::default())
    }

    /// Like [`create`](Self::create), with an explicit configuration.
    ///
    /// # Errors
    ///
    /// See [`create`](Self::create).
    pub fn create_with_config(
        backend: &B,
        direction: Direction,
        config: &MonitorConfig,
    ) -> Result<Self, StreamMonitorError> {
        let client_name = config.client_name_for(direction);
        let (connection, poll) = backend
            .connect(config.server.as_deref(), client_name)
            .map_err(StreamMonitorError::Connect)?;
        tracing::debug!(%direction, client_name, "connecting to audio server");

        // From here on, dropping `monitor` unwinds whatever was set up
        let mut monitor = Self {
            direction,
            shared: Arc::new(Shared::new(connection)),
            event_loop: None,
            _backend: PhantomData,
        };
        monitor.event_loop = Some(
            EventLoop::spawn(Arc::clone(&monitor.shared), poll, config.poll_interval)
                .map_err(StreamMonitorError::EventLoopSpawn)?,
        );

        {
            let mut state = monitor.shared.state.lock();
            monitor.wait_for_connection(&mut state)?;

            let connection = state
                .connection
                .as_mut()
                .ok_or(StreamMonitorError::BadState)?;
            let mut stream = connection
                .create_stream(direction.stream_name(), &SAMPLE_SPEC)
                .map_err(StreamMonitorError::CreateStream)?;
            stream
                .connect(direction, STREAM_FLAGS)
                .map_err(|source| StreamMonitorError::ConnectStream { direction, source })?;
            state.stream = Some(stream);

            monitor.wait_for_stream(&mut state)?;
        }

        tracing::debug!(%direction, "stream ready");
        Ok(monitor)
    }

    /// Returns the direction the monitor was created with.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns `true` if the connection and the stream are still usable.
    pub fn is_healthy(&self) -> bool {
        self.shared.state.lock().is_stream_healthy()
    }

    /// Writes all of `data` to a playback stream, blocking while the server
    /// has no room for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the monitor is not a playback monitor, if the
    /// server reports an invalid writable size or rejects a submission, or if
    /// the connection or the stream goes bad while waiting. How much of
    /// `data` was written before a failure is unspecified.
    pub fn write(&self, data: &[u8]) -> Result<(), StreamMonitorError> {
        self.ensure_direction(Direction::Playback)?;

        let mut state = self.shared.state.lock();
        let mut remaining = data;
        while !remaining.is_empty() {
            let writable = loop {
                let writable = state.stream()?.writable_size();
                match writable {
                    Some(0) => {
                        self.shared.ready.wait(&mut state);
                        state.ensure_healthy()?;
                    }
                    Some(n) => break n,
                    None => return Err(StreamMonitorError::InvalidWritableSize),
                }
            };

            let len = writable.min(remaining.len());
            let (chunk, rest) = remaining.split_at(len);
            state
                .stream_mut()?
                .write(chunk)
                .map_err(|source| StreamMonitorError::Write { len, source })?;
            remaining = rest;
        }

        Ok(())
    }

    /// Fills all of `buf` from a capture stream, blocking while no captured
    /// data is available.
    ///
    /// Captured fragments are read in place; a fragment larger than `buf`
    /// stays staged and serves the following reads.
    ///
    /// # Errors
    ///
    /// Returns an error if the monitor is not a capture monitor, if peeking
    /// or discarding a fragment fails, or if the connection or the stream
    /// goes bad while waiting. How much of `buf` was filled before a failure
    /// is unspecified.
    pub fn read(&self, buf: &mut [u8]) -> Result<(), StreamMonitorError> {
        self.ensure_direction(Direction::Capture)?;

        let mut state = self.shared.state.lock();
        let mut filled = 0;
        while filled < buf.len() {
            let mut staged = match state.staged {
                Some(staged) => staged,
                None => self.stage_next(&mut state)?,
            };

            let len = staged.remaining().min(buf.len() - filled);
            let fragment = state
                .stream()?
                .peeked()
                .ok_or(StreamMonitorError::MissingFragment)?;
            let source = fragment
                .get(staged.offset()..staged.offset() + len)
                .ok_or(StreamMonitorError::MissingFragment)?;
            buf[filled..filled + len].copy_from_slice(source);
            filled += len;
            staged.advance(len);

            if staged.is_drained() {
                state.staged = None;
                state
                    .stream_mut()?
                    .discard()
                    .map_err(StreamMonitorError::Discard)?;
            } else {
                state.staged = Some(staged);
            }
        }

        Ok(())
    }

    /// Stops the event loop and releases the stream and the connection.
    ///
    /// Takes the monitor by value, so it runs exactly once and never while a
    /// `write` or `read` is in progress. Calling it twice does not compile:
    ///
    /// ```compile_fail
    /// use stream_monitor::{Direction, LoopbackServer, StreamMonitor};
    ///
    /// let server = LoopbackServer::default();
    /// let monitor = StreamMonitor::create(&server, Direction::Playback).unwrap();
    /// monitor.destroy();
    /// monitor.destroy();
    /// ```
    pub fn destroy(self) {
        drop(self);
    }

    fn ensure_direction(&self, expected: Direction) -> Result<(), StreamMonitorError> {
        if self.direction == expected {
            Ok(())
        } else {
            Err(StreamMonitorError::WrongDirection {
                direction: self.direction,
            })
        }
    }

    /// Peeks until a data fragment is available and stages it.
    ///
    /// An empty peek waits for the event loop; a hole is dropped and the
    /// peek retried straight away.
    fn stage_next(
        &self,
        state: &mut MutexGuard<'_, MonitorState<B::Connection>>,
    ) -> Result<StagedChunk, StreamMonitorError> {
        loop {
            let peek = state
                .stream_mut()?
                .peek()
                .map_err(StreamMonitorError::Peek)?;
            match peek {
                Peek::Empty | Peek::Data(0) | Peek::Hole(0) => {
                    self.shared.ready.wait(state);
                    state.ensure_healthy()?;
                }
                Peek::Hole(len) => {
                    tracing::trace!(len, "dropping hole in captured stream");
                    state
                        .stream_mut()?
                        .discard()
                        .map_err(StreamMonitorError::Discard)?;
                }
                Peek::Data(len) => {
                    let staged = StagedChunk::new(len);
                    state.staged = Some(staged);
                    return Ok(staged);
                }
            }
        }
    }

    fn wait_for_connection(
        &self,
        state: &mut MutexGuard<'_, MonitorState<B::Connection>>,
    ) -> Result<(), StreamMonitorError> {
        loop {
            let current = state.context_state().unwrap_or(ContextState::Terminated);
            if current == ContextState::Ready {
                tracing::debug!("connection ready");
                return Ok(());
            }
            if !current.is_good() {
                tracing::error!(state = %current, "connection failed before becoming ready");
                return Err(StreamMonitorError::ConnectionNotReady { state: current });
            }
            if !state.loop_alive {
                return Err(StreamMonitorError::EventLoopStopped);
            }
            self.shared.ready.wait(state);
        }
    }

    fn wait_for_stream(
        &self,
        state: &mut MutexGuard<'_, MonitorState<B::Connection>>,
    ) -> Result<(), StreamMonitorError> {
        loop {
            let current = state.stream_state().unwrap_or(StreamState::Terminated);
            if current == StreamState::Ready {
                return Ok(());
            }
            if !current.is_good() {
                tracing::error!(state = %current, "stream failed before becoming ready");
                return Err(StreamMonitorError::StreamNotReady { state: current });
            }
            if !state.loop_alive {
                return Err(StreamMonitorError::EventLoopStopped);
            }
            self.shared.ready.wait(state);
        }
    }

    fn teardown(&mut self) {
        if let Some(mut event_loop) = self.event_loop.take() {
            event_loop.stop();
        }

        let mut state = self.shared.state.lock();
        state.staged = None;
        if let Some(stream) = state.stream.take() {
            drop(stream);
        }
        if let Some(mut connection) = state.connection.take() {
            connection.disconnect();
        }
        drop(state);

        tracing::debug!(direction = %self.direction, "stream monitor released");
    }
}

impl<B: AudioBackend> Drop for StreamMonitor<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<B: AudioBackend> std::fmt::Debug for StreamMonitor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMonitor")
            .field("direction", &self.direction)
            .field("event_loop_running", &self.event_loop.is_some())
            .finish_non_exhaustive()
    }
}
