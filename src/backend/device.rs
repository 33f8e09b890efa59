//! Sound card backend built on CPAL.
//!
//! CPAL streams are callback driven and not `Send`, so each stream lives on
//! its own device thread. The device callback and the monitor exchange audio
//! through a byte ring buffer and report progress through the connection's
//! [`NotificationQueue`].

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat as CpalSampleFormat, SizedSample, Stream, StreamConfig};
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::{
    AudioBackend, Connection, ContextState, Notification, NotificationQueue, Peek, QueuePoll,
    ServerStream, StreamState,
};
use crate::config::{Direction, SampleSpec, StreamFlags};
use crate::error::ERR_UNKNOWN;
use crate::format::{f32_to_i16, i16_to_f32};
use crate::BackendError;

/// Largest fragment handed to capture readers, in bytes.
const MAX_FRAGMENT: usize = 4096;

/// Backend that plays to and records from local sound cards.
///
/// The `server` passed to [`AudioBackend::connect`] names the device to
/// open; `None` picks the host's default input or output device.
#[derive(Debug, Clone)]
pub struct CpalBackend {
    buffer: Duration,
}

impl CpalBackend {
    /// Creates a backend with the default buffer length (500 ms).
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how much audio each stream buffers between the device and the
    /// monitor.
    #[must_use]
    pub fn with_buffer(mut self, buffer: Duration) -> Self {
        self.buffer = buffer;
        self
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self {
            buffer: Duration::from_millis(500),
        }
    }
}

impl AudioBackend for CpalBackend {
    type Connection = CpalConnection;
    type Poll = QueuePoll;

    fn connect(
        &self,
        server: Option<&str>,
        client_name: &str,
    ) -> Result<(CpalConnection, QueuePoll), BackendError> {
        let queue = Arc::new(NotificationQueue::new());
        // There is no server handshake; the host is usable right away
        queue.push(Notification::ContextState(ContextState::Ready));

        tracing::debug!(client_name, device = server.unwrap_or("default"), "cpal host opened");

        let connection = CpalConnection {
            device_name: server.map(str::to_string),
            buffer: self.buffer,
            state: ContextState::Ready,
            queue: Arc::clone(&queue),
            last_error: Arc::new(Mutex::new(BackendError::new(0, "no error"))),
        };
        Ok((connection, QueuePoll::new(queue)))
    }
}

/// Connection to the local audio host.
pub struct CpalConnection {
    device_name: Option<String>,
    buffer: Duration,
    state: ContextState,
    queue: Arc<NotificationQueue>,
    last_error: Arc<Mutex<BackendError>>,
}

impl Connection for CpalConnection {
    type Stream = CpalStream;

    fn state(&self) -> ContextState {
        self.state
    }

    fn last_error(&self) -> BackendError {
        self.last_error.lock().clone()
    }

    fn create_stream(&mut self, name: &str, spec: &SampleSpec) -> Result<CpalStream, BackendError> {
        if self.state != ContextState::Ready {
            return Err(BackendError::msg("host connection is not ready"));
        }

        let capacity = spec.bytes_for_duration(self.buffer).max(spec.frame_size());
        tracing::debug!(name, capacity, "cpal stream created");

        Ok(CpalStream {
            device_name: self.device_name.clone(),
            spec: *spec,
            capacity,
            state: Arc::new(Mutex::new(StreamState::Unconnected)),
            half: None,
            queue: Arc::clone(&self.queue),
            last_error: Arc::clone(&self.last_error),
            thread: None,
            fragment: Vec::with_capacity(MAX_FRAGMENT),
        })
    }

    fn dispatch(&mut self) -> Vec<Notification> {
        self.queue.drain()
    }

    fn disconnect(&mut self) {
        self.state = ContextState::Terminated;
        tracing::debug!("cpal host closed");
    }
}

/// Half of a stream's byte ring that lives in the device callback.
enum CallbackHalf {
    /// The output callback consumes what the monitor writes.
    Output(HeapCons<u8>),
    /// The input callback produces what the monitor reads.
    Input(HeapProd<u8>),
}

/// Half of a stream's byte ring that stays with the [`CpalStream`].
enum StreamHalf {
    Playback(HeapProd<u8>),
    Capture(HeapCons<u8>),
}

/// State handed to the device thread and its error callback.
#[derive(Clone)]
struct DeviceLink {
    state: Arc<Mutex<StreamState>>,
    queue: Arc<NotificationQueue>,
    last_error: Arc<Mutex<BackendError>>,
}

impl DeviceLink {
    fn set_state(&self, state: StreamState) {
        *self.state.lock() = state;
        self.queue.push(Notification::StreamState(state));
    }

    fn fail(&self, error: BackendError) {
        tracing::error!(%error, "audio device failed");
        *self.last_error.lock() = error;
        self.set_state(StreamState::Failed);
    }
}

/// Fills `out` from the ring, padding with silence on underrun. Returns the
/// bytes now free for the writer.
fn fill_output<T: Copy>(
    ring: &mut HeapCons<u8>,
    out: &mut [T],
    silence: T,
    convert: impl Fn(i16) -> T,
) -> usize {
    let mut sample = [0u8; 2];
    for slot in out.iter_mut() {
        *slot = if ring.occupied_len() >= sample.len() {
            ring.pop_slice(&mut sample);
            convert(i16::from_le_bytes(sample))
        } else {
            silence
        };
    }
    ring.vacant_len()
}

/// Appends captured samples to the ring, dropping those that do not fit.
/// Returns the bytes now waiting for the reader.
fn store_input<T: Copy>(
    ring: &mut HeapProd<u8>,
    input: &[T],
    convert: impl Fn(T) -> i16,
) -> usize {
    for &sample in input {
        if ring.vacant_len() < 2 {
            break;
        }
        ring.push_slice(&convert(sample).to_le_bytes());
    }
    ring.occupied_len()
}

/// Owns the device thread that keeps a CPAL stream alive.
struct DeviceThread {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceThread {
    fn spawn(
        device_name: Option<String>,
        config: StreamConfig,
        half: CallbackHalf,
        link: DeviceLink,
    ) -> std::io::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let direction = match half {
            CallbackHalf::Output(_) => Direction::Playback,
            CallbackHalf::Input(_) => Direction::Capture,
        };

        let handle = std::thread::Builder::new()
            .name(format!("stream-monitor-{direction}"))
            .spawn({
                let stop = Arc::clone(&stop);
                move || {
                    let opened = open_stream(device_name.as_deref(), &config, half, &link);
                    let stream = match opened {
                        Ok(stream) => stream,
                        Err(error) => {
                            link.fail(error);
                            return;
                        }
                    };
                    link.set_state(StreamState::Ready);

                    let (stopped, signal) = &*stop;
                    let mut stopped = stopped.lock();
                    while !*stopped {
                        signal.wait(&mut stopped);
                    }
                    drop(stream);
                    tracing::debug!(%direction, "audio device closed");
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        let (stopped, signal) = &*self.stop;
        *stopped.lock() = true;
        signal.notify_all();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("audio device thread panicked");
            }
        }
    }
}

fn find_device(name: Option<&str>, direction: Direction) -> Result<Device, BackendError> {
    let host = cpal::default_host();
    let Some(name) = name else {
        let device = match direction {
            Direction::Playback => host.default_output_device(),
            Direction::Capture => host.default_input_device(),
        };
        return device.ok_or_else(|| BackendError::msg(format!("no default {direction} device")));
    };

    let devices = match direction {
        Direction::Playback => host.output_devices(),
        Direction::Capture => host.input_devices(),
    }
    .map_err(|e| BackendError::msg(e.to_string()))?;

    for device in devices {
        if device.name().is_ok_and(|device_name| device_name == name) {
            return Ok(device);
        }
    }
    Err(BackendError::msg(format!("device not found: {name}")))
}

fn open_stream(
    device_name: Option<&str>,
    config: &StreamConfig,
    half: CallbackHalf,
    link: &DeviceLink,
) -> Result<Stream, BackendError> {
    let direction = match half {
        CallbackHalf::Output(_) => Direction::Playback,
        CallbackHalf::Input(_) => Direction::Capture,
    };
    let device = find_device(device_name, direction)?;
    let supported = match direction {
        Direction::Playback => device.default_output_config(),
        Direction::Capture => device.default_input_config(),
    }
    .map_err(|e| BackendError::msg(e.to_string()))?;

    let stream = match (half, supported.sample_format()) {
        (CallbackHalf::Output(ring), CpalSampleFormat::I16) => {
            build_output::<i16>(&device, config, ring, link, 0, |s| s)
        }
        (CallbackHalf::Output(ring), CpalSampleFormat::F32) => {
            build_output::<f32>(&device, config, ring, link, 0.0, i16_to_f32)
        }
        (CallbackHalf::Input(ring), CpalSampleFormat::I16) => {
            build_input::<i16>(&device, config, ring, link, |s| s)
        }
        (CallbackHalf::Input(ring), CpalSampleFormat::F32) => {
            build_input::<f32>(&device, config, ring, link, f32_to_i16)
        }
        (_, format) => Err(BackendError::msg(format!(
            "unsupported device sample format: {format:?}"
        ))),
    }?;

    stream
        .play()
        .map_err(|e| BackendError::msg(e.to_string()))?;
    tracing::debug!(
        %direction,
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        "audio device opened"
    );
    Ok(stream)
}

fn build_output<T: SizedSample + Send + 'static>(
    device: &Device,
    config: &StreamConfig,
    mut ring: HeapCons<u8>,
    link: &DeviceLink,
    silence: T,
    convert: fn(i16) -> T,
) -> Result<Stream, BackendError> {
    let queue = Arc::clone(&link.queue);
    let error_link = link.clone();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let vacant = fill_output(&mut ring, data, silence, convert);
                queue.push(Notification::WriteReady { bytes: vacant });
            },
            move |err| error_link.fail(BackendError::new(ERR_UNKNOWN, err.to_string())),
            None,
        )
        .map_err(|e| BackendError::msg(e.to_string()))
}

fn build_input<T: SizedSample + Send + 'static>(
    device: &Device,
    config: &StreamConfig,
    mut ring: HeapProd<u8>,
    link: &DeviceLink,
    convert: fn(T) -> i16,
) -> Result<Stream, BackendError> {
    let queue = Arc::clone(&link.queue);
    let error_link = link.clone();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let occupied = store_input(&mut ring, data, convert);
                queue.push(Notification::ReadReady { bytes: occupied });
            },
            move |err| error_link.fail(BackendError::new(ERR_UNKNOWN, err.to_string())),
            None,
        )
        .map_err(|e| BackendError::msg(e.to_string()))
}

/// A playback or capture stream on a local sound card.
pub struct CpalStream {
    device_name: Option<String>,
    spec: SampleSpec,
    capacity: usize,
    state: Arc<Mutex<StreamState>>,
    half: Option<StreamHalf>,
    queue: Arc<NotificationQueue>,
    last_error: Arc<Mutex<BackendError>>,
    thread: Option<DeviceThread>,
    fragment: Vec<u8>,
}

impl CpalStream {
    fn is_ready(&self) -> bool {
        *self.state.lock() == StreamState::Ready
    }

    fn not_ready(direction: Direction) -> BackendError {
        BackendError::msg(format!("stream is not a ready {direction} stream"))
    }
}

impl ServerStream for CpalStream {
    fn state(&self) -> StreamState {
        *self.state.lock()
    }

    fn connect(&mut self, direction: Direction, flags: StreamFlags) -> Result<(), BackendError> {
        if self.thread.is_some() {
            return Err(BackendError::msg("stream already connected"));
        }

        let config = StreamConfig {
            channels: self.spec.channels,
            sample_rate: cpal::SampleRate(self.spec.rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let (prod, cons) = HeapRb::<u8>::new(self.capacity).split();
        let (half, callback_half) = match direction {
            Direction::Playback => (StreamHalf::Playback(prod), CallbackHalf::Output(cons)),
            Direction::Capture => (StreamHalf::Capture(cons), CallbackHalf::Input(prod)),
        };
        let link = DeviceLink {
            state: Arc::clone(&self.state),
            queue: Arc::clone(&self.queue),
            last_error: Arc::clone(&self.last_error),
        };
        link.set_state(StreamState::Creating);

        tracing::debug!(%direction, ?flags, "connecting cpal stream");
        let thread = DeviceThread::spawn(self.device_name.clone(), config, callback_half, link)
            .map_err(|e| BackendError::msg(e.to_string()))?;
        self.half = Some(half);
        self.thread = Some(thread);
        Ok(())
    }

    fn writable_size(&self) -> Option<usize> {
        match &self.half {
            Some(StreamHalf::Playback(ring)) if self.is_ready() => Some(ring.vacant_len()),
            _ => None,
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), BackendError> {
        let ready = self.is_ready();
        let Some(StreamHalf::Playback(ring)) = self.half.as_mut().filter(|_| ready) else {
            return Err(Self::not_ready(Direction::Playback));
        };
        if data.len() > ring.vacant_len() {
            return Err(BackendError::msg(format!(
                "write of {} bytes exceeds the device buffer",
                data.len()
            )));
        }
        ring.push_slice(data);
        Ok(())
    }

    fn peek(&mut self) -> Result<Peek, BackendError> {
        let ready = self.is_ready();
        let Some(StreamHalf::Capture(ring)) = self.half.as_mut().filter(|_| ready) else {
            return Err(Self::not_ready(Direction::Capture));
        };

        if self.fragment.is_empty() {
            let len = ring.occupied_len().min(MAX_FRAGMENT);
            self.fragment.resize(len, 0);
            let popped = ring.pop_slice(&mut self.fragment);
            self.fragment.truncate(popped);
        }

        Ok(if self.fragment.is_empty() {
            Peek::Empty
        } else {
            Peek::Data(self.fragment.len())
        })
    }

    fn peeked(&self) -> Option<&[u8]> {
        (!self.fragment.is_empty()).then_some(self.fragment.as_slice())
    }

    fn discard(&mut self) -> Result<(), BackendError> {
        if self.fragment.is_empty() {
            return Err(BackendError::msg("no fragment to discard"));
        }
        self.fragment.clear();
        Ok(())
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        // Joins the device thread, which closes the device
        self.thread.take();
        *self.state.lock() = StreamState::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SAMPLE_SPEC, STREAM_FLAGS};

    #[test]
    fn test_connection_is_ready_immediately() {
        let backend = CpalBackend::new();
        let (mut connection, _poll) = backend.connect(None, "test").unwrap();

        assert_eq!(connection.state(), ContextState::Ready);
        assert_eq!(
            connection.dispatch(),
            vec![Notification::ContextState(ContextState::Ready)]
        );
    }

    #[test]
    fn test_unconnected_stream() {
        let backend = CpalBackend::new().with_buffer(Duration::from_millis(10));
        let (mut connection, _poll) = backend.connect(None, "test").unwrap();
        let mut stream = connection.create_stream("test", &SAMPLE_SPEC).unwrap();

        assert_eq!(stream.state(), StreamState::Unconnected);
        assert_eq!(stream.writable_size(), None);
        assert!(stream.peek().is_err());
        assert!(stream.discard().is_err());
    }

    /// A capture stream whose device side is driven by hand.
    fn capture_stream(capacity: usize) -> (CpalStream, HeapProd<u8>) {
        let (prod, cons) = HeapRb::<u8>::new(capacity).split();
        let stream = CpalStream {
            device_name: None,
            spec: SAMPLE_SPEC,
            capacity,
            state: Arc::new(Mutex::new(StreamState::Ready)),
            half: Some(StreamHalf::Capture(cons)),
            queue: Arc::new(NotificationQueue::new()),
            last_error: Arc::new(Mutex::new(BackendError::new(0, "no error"))),
            thread: None,
            fragment: Vec::new(),
        };
        (stream, prod)
    }

    #[test]
    fn test_fill_output_pads_with_silence() {
        let (mut prod, mut cons) = HeapRb::<u8>::new(8).split();
        prod.push_slice(&[0x01, 0x02, 0xff, 0xff]);

        let mut out = [7i16; 4];
        let vacant = fill_output(&mut cons, &mut out, 0, |s| s);
        assert_eq!(out, [0x0201, -1, 0, 0]);
        assert_eq!(vacant, 8);
    }

    #[test]
    fn test_store_input_drops_overflow() {
        let (mut prod, mut cons) = HeapRb::<u8>::new(5).split();

        let occupied = store_input(&mut prod, &[1i16, 2, 3], |s| s);
        assert_eq!(occupied, 4);

        let mut bytes = [0u8; 4];
        assert_eq!(cons.pop_slice(&mut bytes), 4);
        assert_eq!(bytes, [1, 0, 2, 0]);
    }

    #[test]
    fn test_capture_callback_runs_while_stream_is_busy() {
        let (mut stream, mut prod) = capture_stream(64);
        store_input(&mut prod, &[10i16, 20], |s| s);
        assert_eq!(stream.peek().unwrap(), Peek::Data(4));

        // The input callback keeps delivering while the reader holds a
        // peeked fragment and the stream state lock
        let state = Arc::clone(&stream.state);
        let guard = state.lock();
        assert_eq!(store_input(&mut prod, &[30i16], |s| s), 2);
        drop(guard);

        assert_eq!(stream.peeked(), Some(&[10, 0, 20, 0][..]));
        stream.discard().unwrap();
        assert_eq!(stream.peek().unwrap(), Peek::Data(2));
        assert_eq!(stream.peeked(), Some(&[30, 0][..]));
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_playback_device_becomes_ready() {
        let backend = CpalBackend::new();
        let (mut connection, _poll) = backend.connect(None, "test").unwrap();
        let mut stream = connection.create_stream("test", &SAMPLE_SPEC).unwrap();
        stream.connect(Direction::Playback, STREAM_FLAGS).unwrap();

        for _ in 0..100 {
            if stream.state() != StreamState::Creating {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(stream.state(), StreamState::Ready);
        assert!(stream.writable_size().is_some_and(|n| n > 0));
    }
}
