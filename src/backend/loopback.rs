//! In-process loopback audio server.
//!
//! The loopback server implements the full backend interface without any
//! hardware: playback streams write into a bounded ring buffer that the
//! server drains on every dispatch, and drained audio is routed into every
//! ready capture stream as fragments. Tests use its hooks to inject captured
//! data, holes and failures, and its [`ServerStats`] to check that nothing
//! leaks.
//!
//! # Example
//!
//! ```
//! use stream_monitor::{Direction, LoopbackServer, StreamMonitor};
//!
//! let server = LoopbackServer::default();
//! let playback = StreamMonitor::create(&server, Direction::Playback)?;
//! let capture = StreamMonitor::create(&server, Direction::Capture)?;
//!
//! playback.write(&[1, 2, 3, 4])?;
//! let mut buf = [0u8; 4];
//! capture.read(&mut buf)?;
//! assert_eq!(buf, [1, 2, 3, 4]);
//!
//! playback.destroy();
//! capture.destroy();
//! # Ok::<(), stream_monitor::StreamMonitorError>(())
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use super::{
    AudioBackend, ContextState, EventPoll, Notification, NotificationQueue, Peek, PollWaker,
    QueuePoll, ServerStream, StreamState,
};
use crate::config::{Direction, SampleSpec, StreamFlags};
use crate::BackendError;

/// Error code for operations on a connection or stream in the wrong state.
pub const ERR_BAD_STATE: i32 = 15;
/// Error code for refused connections.
pub const ERR_CONNECTION_REFUSED: i32 = 6;
/// Error code for invalid arguments.
pub const ERR_INVALID: i32 = 3;
/// Error code reported after a forced failure.
pub const ERR_KILLED: i32 = 12;

/// Configuration for a [`LoopbackServer`].
///
/// # Example
///
/// ```
/// use stream_monitor::LoopbackConfig;
///
/// // Force writers to loop: never offer more than 256 bytes at once.
/// let config = LoopbackConfig {
///     max_request: Some(256),
///     ..Default::default()
/// };
/// assert_eq!(config.fragment_size, 4096);
/// ```
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct LoopbackConfig {
    /// Capacity of each playback stream's server-side buffer in bytes.
    ///
    /// Default: 64 KiB
    pub playback_buffer: usize,

    /// Upper bound on the writable size reported to writers, if any.
    ///
    /// Default: `None`
    pub max_request: Option<usize>,

    /// Largest fragment handed to capture streams, in bytes.
    ///
    /// Default: 4 KiB
    pub fragment_size: usize,

    /// Route drained playback audio into capture streams.
    ///
    /// Default: `true`
    pub route_to_capture: bool,

    /// States a new connection moves through after `Connecting`, one per
    /// dispatch.
    ///
    /// Default: `Authorizing`, `SettingName`, `Ready`
    pub context_script: Vec<ContextState>,

    /// States a stream moves through after `Creating`, one per dispatch.
    ///
    /// Default: `Ready`
    pub stream_script: Vec<StreamState>,

    /// Refuse every connection attempt.
    ///
    /// Default: `false`
    pub fail_connect: bool,

    /// Refuse every stream creation.
    ///
    /// Default: `false`
    pub fail_stream_create: bool,

    /// Refuse every stream connect.
    ///
    /// Default: `false`
    pub fail_stream_connect: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            playback_buffer: 64 * 1024,
            max_request: None,
            fragment_size: 4096,
            route_to_capture: true,
            context_script: vec![
                ContextState::Authorizing,
                ContextState::SettingName,
                ContextState::Ready,
            ],
            stream_script: vec![StreamState::Ready],
            fail_connect: false,
            fail_stream_create: false,
            fail_stream_connect: false,
        }
    }
}

/// Counters describing what a [`LoopbackServer`] has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Connections that have not been released yet.
    pub live_connections: usize,
    /// Streams that have not been released yet.
    pub live_streams: usize,
    /// Event polls that have not been released yet.
    pub live_polls: usize,
    /// Connections ever opened.
    pub connections_opened: usize,
    /// Streams ever created.
    pub streams_created: usize,
    /// Size of every accepted playback submission, in order.
    pub submissions: Vec<usize>,
    /// Fragments and holes discarded by capture streams.
    pub discards: usize,
    /// Holes discarded by capture streams.
    pub holes_discarded: usize,
}

impl ServerStats {
    /// Total bytes accepted from playback streams.
    pub fn bytes_submitted(&self) -> usize {
        self.submissions.iter().sum()
    }
}

/// A captured fragment waiting to be peeked.
#[derive(Debug)]
enum Fragment {
    Data(Vec<u8>),
    Hole(usize),
}

impl Fragment {
    fn len(&self) -> usize {
        match self {
            Self::Data(data) => data.len(),
            Self::Hole(len) => *len,
        }
    }
}

struct ConnectionSlot {
    state: ContextState,
    script: VecDeque<ContextState>,
    queue: Arc<NotificationQueue>,
    last_error: BackendError,
}

struct StreamSlot {
    connection: u64,
    state: StreamState,
    script: VecDeque<StreamState>,
    direction: Option<Direction>,
    flags: StreamFlags,
    playback: Option<HeapRb<u8>>,
    fragments: VecDeque<Fragment>,
}

#[derive(Default)]
struct ServerState {
    next_id: u64,
    connections: HashMap<u64, ConnectionSlot>,
    streams: HashMap<u64, StreamSlot>,
    played: Vec<u8>,
    playback_paused: bool,
    invalid_writable_size: bool,
    stats: ServerStats,
}

impl ServerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn notify(&self, connection: u64, notification: Notification) {
        if let Some(slot) = self.connections.get(&connection) {
            slot.queue.push(notification);
        }
    }

    /// Advances every script of `connection` by one step.
    fn advance_scripts(&mut self, connection: u64) -> bool {
        let mut pending = false;

        if let Some(slot) = self.connections.get_mut(&connection) {
            if let Some(next) = slot.script.pop_front() {
                slot.state = next;
                slot.queue.push(Notification::ContextState(next));
            }
            pending |= !slot.script.is_empty();
        }

        // Streams only progress once their connection is ready
        let ready = self
            .connections
            .get(&connection)
            .is_some_and(|slot| slot.state == ContextState::Ready);
        let mut changed = Vec::new();
        for stream in self.streams.values_mut() {
            if stream.connection != connection || !ready {
                continue;
            }
            if let Some(next) = stream.script.pop_front() {
                stream.state = next;
                changed.push(next);
            }
            pending |= !stream.script.is_empty();
        }
        for state in changed {
            self.notify(connection, Notification::StreamState(state));
        }

        pending
    }

    /// Drains the playback buffers of `connection` and routes the audio.
    fn drain_playback(&mut self, connection: u64, fragment_size: usize, route: bool) {
        if self.playback_paused {
            return;
        }

        let mut drained = Vec::new();
        let mut notifications = Vec::new();
        for stream in self.streams.values_mut() {
            if stream.connection != connection || stream.state != StreamState::Ready {
                continue;
            }
            let Some(buffer) = stream.playback.as_mut() else {
                continue;
            };
            let available = buffer.occupied_len();
            if available == 0 {
                continue;
            }
            let start = drained.len();
            drained.resize(start + available, 0);
            let popped = buffer.pop_slice(&mut drained[start..]);
            drained.truncate(start + popped);

            notifications.push(Notification::WriteReady {
                bytes: buffer.vacant_len(),
            });
            if stream.flags.auto_timing_update {
                notifications.push(Notification::LatencyUpdate);
            }
        }
        for notification in notifications {
            self.notify(connection, notification);
        }

        if drained.is_empty() {
            return;
        }
        tracing::trace!(bytes = drained.len(), "loopback played audio");
        if route {
            self.route_to_capture(&drained, fragment_size);
        }
        self.played.extend_from_slice(&drained);
    }

    fn route_to_capture(&mut self, data: &[u8], fragment_size: usize) {
        let mut ready = Vec::new();
        for stream in self.streams.values_mut() {
            if stream.direction != Some(Direction::Capture) || stream.state != StreamState::Ready {
                continue;
            }
            for chunk in data.chunks(fragment_size.max(1)) {
                stream.fragments.push_back(Fragment::Data(chunk.to_vec()));
            }
            ready.push(stream.connection);
        }
        for connection in ready {
            self.notify(connection, Notification::ReadReady { bytes: data.len() });
        }
    }

    fn push_fragment(&mut self, fragment: impl Fn() -> Fragment) {
        let mut ready = Vec::new();
        for stream in self.streams.values_mut() {
            if stream.direction != Some(Direction::Capture) || stream.state != StreamState::Ready {
                continue;
            }
            let fragment = fragment();
            ready.push((stream.connection, fragment.len()));
            stream.fragments.push_back(fragment);
        }
        for (connection, bytes) in ready {
            self.notify(connection, Notification::ReadReady { bytes });
        }
    }
}

/// An in-process audio server that plays back into its own capture streams.
///
/// `LoopbackServer` is a cheap handle: clones share the same server, so a
/// test can keep one clone for its hooks while monitors connect through
/// another.
#[derive(Clone)]
pub struct LoopbackServer {
    config: Arc<LoopbackConfig>,
    state: Arc<Mutex<ServerState>>,
}

impl LoopbackServer {
    /// Creates a server with the given configuration.
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(ServerState::default())),
        }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Returns a snapshot of the server counters.
    pub fn stats(&self) -> ServerStats {
        self.state.lock().stats.clone()
    }

    /// Takes all audio played so far.
    pub fn take_played(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().played)
    }

    /// Delivers `data` to every ready capture stream, split into fragments.
    pub fn push_capture(&self, data: &[u8]) {
        let fragment_size = self.config.fragment_size.max(1);
        let mut state = self.state.lock();
        for chunk in data.chunks(fragment_size) {
            state.push_fragment(|| Fragment::Data(chunk.to_vec()));
        }
    }

    /// Delivers a hole of `len` bytes to every ready capture stream.
    ///
    /// A zero-length hole is no gap at all and is ignored.
    pub fn push_hole(&self, len: usize) {
        if len == 0 {
            return;
        }
        self.state.lock().push_fragment(|| Fragment::Hole(len));
    }

    /// Stops or resumes draining playback buffers.
    ///
    /// While paused, writers block once the playback buffer is full.
    pub fn pause_playback(&self, paused: bool) {
        let mut state = self.state.lock();
        state.playback_paused = paused;
        if !paused {
            for slot in state.connections.values() {
                slot.queue.wake();
            }
        }
    }

    /// Makes every writable size query report an invalid value.
    pub fn set_invalid_writable_size(&self, invalid: bool) {
        self.state.lock().invalid_writable_size = invalid;
    }

    /// Moves every stream to [`StreamState::Failed`] and notifies it.
    pub fn fail_streams(&self) {
        let mut state = self.state.lock();
        let mut failed = Vec::new();
        for stream in state.streams.values_mut() {
            stream.state = StreamState::Failed;
            stream.script.clear();
            failed.push(stream.connection);
        }
        for connection in failed {
            if let Some(slot) = state.connections.get_mut(&connection) {
                slot.last_error = BackendError::new(ERR_KILLED, "stream killed by server");
            }
            state.notify(connection, Notification::StreamState(StreamState::Failed));
        }
    }

    /// Moves every connection to [`ContextState::Failed`] and notifies it.
    pub fn fail_connections(&self) {
        let mut state = self.state.lock();
        for slot in state.connections.values_mut() {
            slot.state = ContextState::Failed;
            slot.script.clear();
            slot.last_error = BackendError::new(ERR_CONNECTION_REFUSED, "connection lost");
            slot.queue.push(Notification::ContextState(ContextState::Failed));
        }
    }
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl std::fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackServer")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl AudioBackend for LoopbackServer {
    type Connection = LoopbackConnection;
    type Poll = LoopbackPoll;

    fn connect(
        &self,
        server: Option<&str>,
        client_name: &str,
    ) -> Result<(LoopbackConnection, LoopbackPoll), BackendError> {
        if self.config.fail_connect {
            return Err(BackendError::new(
                ERR_CONNECTION_REFUSED,
                "loopback server refused the connection",
            ));
        }

        let queue = Arc::new(NotificationQueue::new());
        let mut state = self.state.lock();
        let id = state.allocate_id();
        state.connections.insert(
            id,
            ConnectionSlot {
                state: ContextState::Connecting,
                script: self.config.context_script.iter().copied().collect(),
                queue: Arc::clone(&queue),
                last_error: BackendError::new(0, "no error"),
            },
        );
        state.stats.live_connections += 1;
        state.stats.live_polls += 1;
        state.stats.connections_opened += 1;
        drop(state);

        tracing::debug!(
            id,
            client_name,
            server = server.unwrap_or("loopback"),
            "loopback connection opened"
        );

        // The first script step happens on the first dispatch
        queue.wake();

        let connection = LoopbackConnection {
            id,
            config: Arc::clone(&self.config),
            server: Arc::clone(&self.state),
            queue: Arc::clone(&queue),
        };
        let poll = LoopbackPoll {
            inner: QueuePoll::new(queue),
            server: Arc::clone(&self.state),
        };
        Ok((connection, poll))
    }
}

/// A connection to a [`LoopbackServer`].
pub struct LoopbackConnection {
    id: u64,
    config: Arc<LoopbackConfig>,
    server: Arc<Mutex<ServerState>>,
    queue: Arc<NotificationQueue>,
}

impl super::Connection for LoopbackConnection {
    type Stream = LoopbackStream;

    fn state(&self) -> ContextState {
        self.server
            .lock()
            .connections
            .get(&self.id)
            .map_or(ContextState::Terminated, |slot| slot.state)
    }

    fn last_error(&self) -> BackendError {
        self.server.lock().connections.get(&self.id).map_or_else(
            || BackendError::new(ERR_BAD_STATE, "connection released"),
            |slot| slot.last_error.clone(),
        )
    }

    fn create_stream(
        &mut self,
        name: &str,
        spec: &SampleSpec,
    ) -> Result<LoopbackStream, BackendError> {
        if self.config.fail_stream_create {
            return Err(BackendError::new(ERR_INVALID, "stream creation refused"));
        }
        if spec.frame_size() == 0 || spec.rate == 0 {
            return Err(BackendError::new(ERR_INVALID, "invalid sample spec"));
        }

        let mut state = self.server.lock();
        if state.connections.get(&self.id).map(|slot| slot.state) != Some(ContextState::Ready) {
            return Err(BackendError::new(ERR_BAD_STATE, "connection is not ready"));
        }
        let id = state.allocate_id();
        state.streams.insert(
            id,
            StreamSlot {
                connection: self.id,
                state: StreamState::Unconnected,
                script: VecDeque::new(),
                direction: None,
                flags: StreamFlags::default(),
                playback: None,
                fragments: VecDeque::new(),
            },
        );
        state.stats.live_streams += 1;
        state.stats.streams_created += 1;
        drop(state);

        tracing::debug!(id, name, "loopback stream created");

        Ok(LoopbackStream {
            id,
            config: Arc::clone(&self.config),
            server: Arc::clone(&self.server),
            queue: Arc::clone(&self.queue),
            current: None,
        })
    }

    fn dispatch(&mut self) -> Vec<Notification> {
        let mut state = self.server.lock();
        let pending = state.advance_scripts(self.id);
        state.drain_playback(
            self.id,
            self.config.fragment_size,
            self.config.route_to_capture,
        );
        drop(state);

        if pending {
            self.queue.wake();
        }
        self.queue.drain()
    }

    fn disconnect(&mut self) {
        let mut state = self.server.lock();
        if let Some(slot) = state.connections.get_mut(&self.id) {
            slot.state = ContextState::Terminated;
            slot.script.clear();
        }
        for stream in state.streams.values_mut() {
            if stream.connection == self.id {
                stream.state = StreamState::Terminated;
                stream.script.clear();
            }
        }
        tracing::debug!(id = self.id, "loopback connection closed");
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        let mut state = self.server.lock();
        if state.connections.remove(&self.id).is_some() {
            state.stats.live_connections -= 1;
        }
    }
}

/// Event poll for a [`LoopbackConnection`].
pub struct LoopbackPoll {
    inner: QueuePoll,
    server: Arc<Mutex<ServerState>>,
}

impl EventPoll for LoopbackPoll {
    fn wait(&mut self, timeout: Duration) -> Result<(), BackendError> {
        self.inner.wait(timeout)
    }

    fn waker(&self) -> PollWaker {
        self.inner.waker()
    }
}

impl Drop for LoopbackPoll {
    fn drop(&mut self) {
        self.server.lock().stats.live_polls -= 1;
    }
}

/// A stream on a [`LoopbackConnection`].
pub struct LoopbackStream {
    id: u64,
    config: Arc<LoopbackConfig>,
    server: Arc<Mutex<ServerState>>,
    queue: Arc<NotificationQueue>,
    current: Option<Fragment>,
}

impl LoopbackStream {
    fn slot_state(&self) -> Option<(StreamState, Option<Direction>)> {
        self.server
            .lock()
            .streams
            .get(&self.id)
            .map(|slot| (slot.state, slot.direction))
    }

    fn ensure_ready(&self, direction: Direction) -> Result<(), BackendError> {
        match self.slot_state() {
            Some((StreamState::Ready, Some(d))) if d == direction => Ok(()),
            Some((StreamState::Ready, _)) => Err(BackendError::new(
                ERR_BAD_STATE,
                format!("stream is not a {direction} stream"),
            )),
            _ => Err(BackendError::new(ERR_BAD_STATE, "stream is not ready")),
        }
    }
}

impl ServerStream for LoopbackStream {
    fn state(&self) -> StreamState {
        self.slot_state()
            .map_or(StreamState::Terminated, |(state, _)| state)
    }

    fn connect(&mut self, direction: Direction, flags: StreamFlags) -> Result<(), BackendError> {
        if self.config.fail_stream_connect {
            return Err(BackendError::new(ERR_INVALID, "stream connect refused"));
        }

        let mut state = self.server.lock();
        let slot = state
            .streams
            .get_mut(&self.id)
            .ok_or_else(|| BackendError::new(ERR_BAD_STATE, "stream released"))?;
        if slot.state != StreamState::Unconnected {
            return Err(BackendError::new(ERR_BAD_STATE, "stream already connected"));
        }

        slot.state = StreamState::Creating;
        slot.script = self.config.stream_script.iter().copied().collect();
        slot.direction = Some(direction);
        slot.flags = flags;
        if direction == Direction::Playback {
            slot.playback = Some(HeapRb::new(self.config.playback_buffer.max(1)));
        }
        drop(state);

        self.queue.wake();
        Ok(())
    }

    fn writable_size(&self) -> Option<usize> {
        let state = self.server.lock();
        if state.invalid_writable_size {
            return None;
        }
        let slot = state.streams.get(&self.id)?;
        if slot.state != StreamState::Ready {
            return None;
        }
        let vacant = slot.playback.as_ref()?.vacant_len();
        Some(self.config.max_request.map_or(vacant, |max| vacant.min(max)))
    }

    fn write(&mut self, data: &[u8]) -> Result<(), BackendError> {
        self.ensure_ready(Direction::Playback)?;

        let mut state = self.server.lock();
        let buffer = state
            .streams
            .get_mut(&self.id)
            .and_then(|slot| slot.playback.as_mut())
            .ok_or_else(|| BackendError::new(ERR_BAD_STATE, "stream has no playback buffer"))?;
        if data.len() > buffer.vacant_len() {
            return Err(BackendError::new(
                ERR_INVALID,
                format!("write of {} bytes exceeds the playback buffer", data.len()),
            ));
        }
        buffer.push_slice(data);
        state.stats.submissions.push(data.len());
        drop(state);

        self.queue.wake();
        Ok(())
    }

    fn peek(&mut self) -> Result<Peek, BackendError> {
        self.ensure_ready(Direction::Capture)?;

        if self.current.is_none() {
            let mut state = self.server.lock();
            let slot = state
                .streams
                .get_mut(&self.id)
                .ok_or_else(|| BackendError::new(ERR_BAD_STATE, "stream released"))?;
            self.current = slot.fragments.pop_front();
        }

        Ok(match &self.current {
            None => Peek::Empty,
            Some(Fragment::Hole(len)) => Peek::Hole(*len),
            Some(Fragment::Data(data)) => Peek::Data(data.len()),
        })
    }

    fn peeked(&self) -> Option<&[u8]> {
        match &self.current {
            Some(Fragment::Data(data)) => Some(data),
            _ => None,
        }
    }

    fn discard(&mut self) -> Result<(), BackendError> {
        let fragment = self
            .current
            .take()
            .ok_or_else(|| BackendError::new(ERR_BAD_STATE, "no fragment to discard"))?;

        let mut state = self.server.lock();
        state.stats.discards += 1;
        if matches!(fragment, Fragment::Hole(_)) {
            state.stats.holes_discarded += 1;
        }
        Ok(())
    }
}

impl Drop for LoopbackStream {
    fn drop(&mut self) {
        let mut state = self.server.lock();
        if state.streams.remove(&self.id).is_some() {
            state.stats.live_streams -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Connection;
    use crate::config::{SAMPLE_SPEC, STREAM_FLAGS};

    /// Dispatches until the connection settles or the step budget runs out.
    fn settle(connection: &mut LoopbackConnection) -> Vec<Notification> {
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.extend(connection.dispatch());
        }
        seen
    }

    fn ready_stream(
        server: &LoopbackServer,
        direction: Direction,
    ) -> (LoopbackConnection, LoopbackPoll, LoopbackStream) {
        let (mut connection, poll) = server.connect(None, "test").unwrap();
        settle(&mut connection);
        let mut stream = connection.create_stream("test", &SAMPLE_SPEC).unwrap();
        stream.connect(direction, STREAM_FLAGS).unwrap();
        settle(&mut connection);
        (connection, poll, stream)
    }

    #[test]
    fn test_connection_follows_script() {
        let server = LoopbackServer::default();
        let (mut connection, _poll) = server.connect(None, "test").unwrap();
        assert_eq!(connection.state(), ContextState::Connecting);

        let seen = settle(&mut connection);
        assert_eq!(connection.state(), ContextState::Ready);
        assert_eq!(
            seen,
            vec![
                Notification::ContextState(ContextState::Authorizing),
                Notification::ContextState(ContextState::SettingName),
                Notification::ContextState(ContextState::Ready),
            ]
        );
    }

    #[test]
    fn test_create_stream_requires_ready_connection() {
        let server = LoopbackServer::default();
        let (mut connection, _poll) = server.connect(None, "test").unwrap();
        assert!(connection.create_stream("early", &SAMPLE_SPEC).is_err());
    }

    #[test]
    fn test_stream_becomes_ready() {
        let server = LoopbackServer::default();
        let (_connection, _poll, stream) = ready_stream(&server, Direction::Playback);
        assert_eq!(stream.state(), StreamState::Ready);
        assert_eq!(stream.writable_size(), Some(64 * 1024));
    }

    #[test]
    fn test_writable_size_respects_max_request() {
        let server = LoopbackServer::new(LoopbackConfig {
            max_request: Some(100),
            ..Default::default()
        });
        let (_connection, _poll, stream) = ready_stream(&server, Direction::Playback);
        assert_eq!(stream.writable_size(), Some(100));
    }

    #[test]
    fn test_invalid_writable_size() {
        let server = LoopbackServer::default();
        let (_connection, _poll, stream) = ready_stream(&server, Direction::Playback);
        server.set_invalid_writable_size(true);
        assert_eq!(stream.writable_size(), None);
    }

    #[test]
    fn test_playback_drains_on_dispatch() {
        let server = LoopbackServer::new(LoopbackConfig {
            playback_buffer: 16,
            ..Default::default()
        });
        let (mut connection, _poll, mut stream) = ready_stream(&server, Direction::Playback);

        stream.write(&[7; 16]).unwrap();
        assert_eq!(stream.writable_size(), Some(0));
        assert!(stream.write(&[1]).is_err());

        let seen = connection.dispatch();
        assert!(seen.contains(&Notification::WriteReady { bytes: 16 }));
        assert!(seen.contains(&Notification::LatencyUpdate));
        assert_eq!(stream.writable_size(), Some(16));
        assert_eq!(server.take_played(), vec![7; 16]);
        assert_eq!(server.stats().submissions, vec![16]);
    }

    #[test]
    fn test_paused_playback_keeps_buffer_full() {
        let server = LoopbackServer::new(LoopbackConfig {
            playback_buffer: 8,
            ..Default::default()
        });
        let (mut connection, _poll, mut stream) = ready_stream(&server, Direction::Playback);
        server.pause_playback(true);

        stream.write(&[1; 8]).unwrap();
        connection.dispatch();
        assert_eq!(stream.writable_size(), Some(0));

        server.pause_playback(false);
        connection.dispatch();
        assert_eq!(stream.writable_size(), Some(8));
    }

    #[test]
    fn test_capture_peek_and_discard() {
        let server = LoopbackServer::new(LoopbackConfig {
            fragment_size: 3,
            ..Default::default()
        });
        let (_connection, _poll, mut stream) = ready_stream(&server, Direction::Capture);

        assert_eq!(stream.peek().unwrap(), Peek::Empty);

        server.push_capture(&[1, 2, 3, 4]);
        assert_eq!(stream.peek().unwrap(), Peek::Data(3));
        // Peeking again returns the same fragment
        assert_eq!(stream.peek().unwrap(), Peek::Data(3));
        assert_eq!(stream.peeked(), Some(&[1, 2, 3][..]));
        stream.discard().unwrap();

        assert_eq!(stream.peek().unwrap(), Peek::Data(1));
        assert_eq!(stream.peeked(), Some(&[4][..]));
        stream.discard().unwrap();

        assert!(stream.discard().is_err());
        assert_eq!(server.stats().discards, 2);
    }

    #[test]
    fn test_capture_hole() {
        let server = LoopbackServer::default();
        let (_connection, _poll, mut stream) = ready_stream(&server, Direction::Capture);

        server.push_hole(32);
        assert_eq!(stream.peek().unwrap(), Peek::Hole(32));
        assert_eq!(stream.peeked(), None);
        stream.discard().unwrap();
        assert_eq!(server.stats().holes_discarded, 1);
    }

    #[test]
    fn test_zero_length_hole_is_ignored() {
        let server = LoopbackServer::default();
        let (_connection, _poll, mut stream) = ready_stream(&server, Direction::Capture);

        server.push_hole(0);
        assert_eq!(stream.peek().unwrap(), Peek::Empty);

        server.push_capture(&[1, 2]);
        assert_eq!(stream.peek().unwrap(), Peek::Data(2));
    }

    #[test]
    fn test_peek_on_playback_stream_fails() {
        let server = LoopbackServer::default();
        let (_connection, _poll, mut stream) = ready_stream(&server, Direction::Playback);
        assert!(stream.peek().is_err());
    }

    #[test]
    fn test_release_counts() {
        let server = LoopbackServer::default();
        let (connection, poll, stream) = ready_stream(&server, Direction::Capture);

        let stats = server.stats();
        assert_eq!(stats.live_connections, 1);
        assert_eq!(stats.live_streams, 1);
        assert_eq!(stats.live_polls, 1);

        drop(stream);
        drop(connection);
        drop(poll);

        let stats = server.stats();
        assert_eq!(stats.live_connections, 0);
        assert_eq!(stats.live_streams, 0);
        assert_eq!(stats.live_polls, 0);
        assert_eq!(stats.connections_opened, 1);
        assert_eq!(stats.streams_created, 1);
    }

    #[test]
    fn test_fail_streams_notifies() {
        let server = LoopbackServer::default();
        let (mut connection, _poll, stream) = ready_stream(&server, Direction::Capture);

        server.fail_streams();
        assert_eq!(stream.state(), StreamState::Failed);
        assert!(connection
            .dispatch()
            .contains(&Notification::StreamState(StreamState::Failed)));
        assert_eq!(connection.last_error().code(), ERR_KILLED);
    }

    #[test]
    fn test_disconnect_terminates_streams() {
        let server = LoopbackServer::default();
        let (mut connection, _poll, stream) = ready_stream(&server, Direction::Playback);

        connection.disconnect();
        assert_eq!(connection.state(), ContextState::Terminated);
        assert_eq!(stream.state(), StreamState::Terminated);
    }

    #[test]
    fn test_connect_refused() {
        let server = LoopbackServer::new(LoopbackConfig {
            fail_connect: true,
            ..Default::default()
        });
        assert!(server.connect(None, "test").is_err());
        assert_eq!(server.stats().live_connections, 0);
    }
}
