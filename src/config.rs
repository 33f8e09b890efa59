//! Configuration types for stream monitors.
//!
//! The sample format and the stream flags are fixed for every monitor; only
//! where to connect and how the event loop paces itself are configurable.

use std::fmt;
use std::time::Duration;

/// Direction of audio flow for a monitored stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Audio is written by the caller and played by the server.
    Playback,
    /// Audio is captured by the server and read by the caller.
    Capture,
}

impl Direction {
    /// Name given to streams created for this direction.
    #[must_use]
    pub fn stream_name(self) -> &'static str {
        match self {
            Self::Playback => "stream-monitor playback",
            Self::Capture => "stream-monitor capture",
        }
    }

    /// Default client name announced to the server for this direction.
    #[must_use]
    pub fn client_name(self) -> &'static str {
        match self {
            Self::Playback => "stream-monitor-play",
            Self::Capture => "stream-monitor-rec",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Playback => f.write_str("playback"),
            Self::Capture => f.write_str("capture"),
        }
    }
}

/// PCM sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Signed 16-bit integers, little endian.
    S16Le,
}

impl SampleFormat {
    /// Size of one sample in bytes.
    #[must_use]
    pub const fn sample_size(self) -> usize {
        match self {
            Self::S16Le => 2,
        }
    }
}

/// Sample format, rate and channel count of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    /// Sample encoding.
    pub format: SampleFormat,
    /// Frames per second.
    pub rate: u32,
    /// Interleaved channels per frame.
    pub channels: u16,
}

impl SampleSpec {
    /// Size of one frame (one sample for every channel) in bytes.
    #[must_use]
    pub const fn frame_size(&self) -> usize {
        self.format.sample_size() * self.channels as usize
    }

    /// Number of bytes that make up one second of audio.
    #[must_use]
    pub const fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.rate as usize
    }

    /// Number of bytes for the given duration, rounded down to whole frames.
    #[must_use]
    pub fn bytes_for_duration(&self, duration: Duration) -> usize {
        let frames = (u128::from(self.rate) * duration.as_micros() / 1_000_000) as usize;
        frames * self.frame_size()
    }
}

/// The format every monitored stream uses: S16LE, 48kHz, stereo.
pub const SAMPLE_SPEC: SampleSpec = SampleSpec {
    format: SampleFormat::S16Le,
    rate: 48000,
    channels: 2,
};

/// Flags passed when connecting a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct StreamFlags {
    /// Interpolate timing information between server updates.
    pub interpolate_timing: bool,
    /// Let the server adjust its buffering to the requested latency.
    pub adjust_latency: bool,
    /// Request timing updates from the server automatically.
    pub auto_timing_update: bool,
}

/// The flags every monitored stream is connected with.
pub const STREAM_FLAGS: StreamFlags = StreamFlags {
    interpolate_timing: true,
    adjust_latency: true,
    auto_timing_update: true,
};

/// Configuration for creating a [`StreamMonitor`](crate::StreamMonitor).
///
/// # Example
///
/// ```
/// use stream_monitor::MonitorConfig;
/// use std::time::Duration;
///
/// let config = MonitorConfig {
///     client_name: Some("my-player".to_string()),
///     poll_interval: Duration::from_millis(5),
///     ..Default::default()
/// };
/// assert!(config.server.is_none());
/// ```
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Server to connect to. `None` selects the backend's default server.
    pub server: Option<String>,

    /// Client name announced to the server.
    ///
    /// Default: derived from the direction (see [`Direction::client_name`]).
    pub client_name: Option<String>,

    /// Longest time the event loop waits for backend activity before it
    /// dispatches anyway.
    ///
    /// Default: 10ms
    pub poll_interval: Duration,
}

impl MonitorConfig {
    /// Returns the client name to announce for the given direction.
    pub(crate) fn client_name_for(&self, direction: Direction) -> &str {
        self.client_name
            .as_deref()
            .unwrap_or(direction.client_name())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            server: None,
            client_name: None,
            poll_interval: Duration::from_millis(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_spec_sizes() {
        assert_eq!(SAMPLE_SPEC.frame_size(), 4);
        assert_eq!(SAMPLE_SPEC.bytes_per_second(), 192_000);
    }

    #[test]
    fn test_bytes_for_duration() {
        assert_eq!(
            SAMPLE_SPEC.bytes_for_duration(Duration::from_millis(100)),
            19_200
        );
        // Rounds down to whole frames
        assert_eq!(
            SAMPLE_SPEC.bytes_for_duration(Duration::from_micros(30)) % 4,
            0
        );
    }

    #[test]
    fn test_stream_flags_all_set() {
        assert!(STREAM_FLAGS.interpolate_timing);
        assert!(STREAM_FLAGS.adjust_latency);
        assert!(STREAM_FLAGS.auto_timing_update);
    }

    #[test]
    fn test_monitor_config_defaults() {
        let config = MonitorConfig::default();
        assert!(config.server.is_none());
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(
            config.client_name_for(Direction::Playback),
            "stream-monitor-play"
        );
        assert_eq!(
            config.client_name_for(Direction::Capture),
            "stream-monitor-rec"
        );
    }

    #[test]
    fn test_monitor_config_custom_client_name() {
        let config = MonitorConfig {
            client_name: Some("custom".to_string()),
            ..Default::default()
        };
        assert_eq!(config.client_name_for(Direction::Capture), "custom");
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Playback.to_string(), "playback");
        assert_eq!(Direction::Capture.to_string(), "capture");
    }
}
