//! Loopback round trip example.
//!
//! Plays a short tone into the in-process loopback server and records it
//! back through a capture monitor.
//!
//! Run with: cargo run --example loopback_roundtrip

use std::time::Duration;
use stream_monitor::format::{bytes_to_samples, samples_to_bytes, sine_tone};
use stream_monitor::{Direction, LoopbackServer, StreamMonitor, SAMPLE_SPEC};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for debug output
    tracing_subscriber::fmt::init();

    let server = LoopbackServer::default();

    // Capture first, so the server has somewhere to route played audio
    let capture = StreamMonitor::create(&server, Direction::Capture)?;
    let playback = StreamMonitor::create(&server, Direction::Playback)?;

    // 100ms of a 440Hz tone
    let frames =
        SAMPLE_SPEC.bytes_for_duration(Duration::from_millis(100)) / SAMPLE_SPEC.frame_size();
    let tone = samples_to_bytes(&sine_tone(440.0, SAMPLE_SPEC.rate, SAMPLE_SPEC.channels, frames));
    println!("Playing {} bytes...", tone.len());
    playback.write(&tone)?;

    let mut recorded = vec![0u8; tone.len()];
    capture.read(&mut recorded)?;

    let samples = bytes_to_samples(&recorded);
    let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
    println!("Recorded {} samples, peak {peak}", samples.len());
    println!("Identical: {}", recorded == tone);
    println!("Stats: {:?}", server.stats());

    playback.destroy();
    capture.destroy();

    Ok(())
}
