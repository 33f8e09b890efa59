//! Plays a tone on the default output device.
//!
//! Run with: cargo run --example device_tone --features cpal

use std::time::Duration;
use stream_monitor::format::{samples_to_bytes, sine_tone};
use stream_monitor::{CpalBackend, Direction, StreamMonitor, SAMPLE_SPEC};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let backend = CpalBackend::new().with_buffer(Duration::from_millis(200));
    let monitor = StreamMonitor::create(&backend, Direction::Playback)?;

    // 2 seconds of a 440Hz tone, written in 100ms pieces
    let frames = SAMPLE_SPEC.rate as usize / 10;
    let tone = samples_to_bytes(&sine_tone(440.0, SAMPLE_SPEC.rate, SAMPLE_SPEC.channels, frames));

    println!("Playing 440Hz for 2 seconds...");
    for _ in 0..20 {
        monitor.write(&tone)?;
    }

    // Let the buffered tail play out before closing the device
    std::thread::sleep(Duration::from_millis(300));
    monitor.destroy();

    println!("Done");
    Ok(())
}
