//! # stream-monitor
//!
//! Blocking reads and writes over callback-driven audio streams.
//!
//! Audio servers report progress asynchronously: a connection changes state,
//! a playback stream gains room, a capture stream receives a fragment.
//! `stream-monitor` runs the server's event loop on a background thread and
//! parks callers on a condition variable until their stream can make
//! progress, so playing or recording audio becomes straight-line code.
//!
//! ## Quick Start
//!
//! ```
//! use stream_monitor::{Direction, LoopbackServer, StreamMonitor};
//!
//! // The loopback server plays back into its own capture streams
//! let server = LoopbackServer::default();
//! let capture = StreamMonitor::create(&server, Direction::Capture)?;
//! let playback = StreamMonitor::create(&server, Direction::Playback)?;
//!
//! playback.write(&[0x10, 0x20, 0x30, 0x40])?;
//!
//! let mut buf = [0u8; 4];
//! capture.read(&mut buf)?;
//! assert_eq!(buf, [0x10, 0x20, 0x30, 0x40]);
//!
//! playback.destroy();
//! capture.destroy();
//! # Ok::<(), stream_monitor::StreamMonitorError>(())
//! ```
//!
//! ## Architecture
//!
//! Each [`StreamMonitor`] owns two threads of control:
//!
//! - **Event loop thread**: waits for backend activity, then dispatches
//!   notifications with the monitor lock held. Handlers only wake waiters.
//! - **Caller threads**: hold the monitor lock while querying or touching
//!   the stream and release it while waiting.
//!
//! Backends plug in through the [`AudioBackend`] trait. The crate ships an
//! in-process [`LoopbackServer`] and, with the `cpal` feature, a sound card
//! backend.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod backend;
mod config;
mod error;
pub mod format;
mod monitor;

pub use backend::{
    AudioBackend, Connection, ContextState, EventPoll, LoopbackConfig, LoopbackServer,
    Notification, Peek, PollWaker, ServerStats, ServerStream, StreamState,
};
pub use config::{
    Direction, MonitorConfig, SampleFormat, SampleSpec, StreamFlags, SAMPLE_SPEC, STREAM_FLAGS,
};
pub use error::{BackendError, StreamMonitorError, ERR_UNKNOWN};
pub use monitor::StreamMonitor;

#[cfg(feature = "cpal")]
pub use backend::CpalBackend;
