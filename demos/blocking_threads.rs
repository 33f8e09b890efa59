//! Blocking writer and reader on separate threads.
//!
//! A writer thread streams audio faster than the server plays it and blocks
//! whenever the playback buffer is full; a reader thread blocks until the
//! routed audio shows up on its capture stream.
//!
//! Run with: cargo run --example blocking_threads

use std::thread;
use stream_monitor::{Direction, LoopbackConfig, LoopbackServer, StreamMonitor};

const CHUNK: usize = 4096;
const CHUNKS: usize = 64;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // A small playback buffer makes the writer wait on the server
    let server = LoopbackServer::new(LoopbackConfig {
        playback_buffer: 8 * 1024,
        max_request: Some(2048),
        ..Default::default()
    });
    let capture = StreamMonitor::create(&server, Direction::Capture)?;
    let playback = StreamMonitor::create(&server, Direction::Playback)?;

    let received = thread::scope(|s| {
        let writer = s.spawn(|| {
            for i in 0..CHUNKS {
                let chunk = vec![i as u8; CHUNK];
                playback.write(&chunk)?;
            }
            Ok::<_, stream_monitor::StreamMonitorError>(())
        });

        let reader = s.spawn(|| {
            let mut buf = vec![0u8; CHUNK];
            let mut received = 0;
            for i in 0..CHUNKS {
                capture.read(&mut buf)?;
                if buf.iter().any(|&b| b != i as u8) {
                    tracing::warn!(chunk = i, "chunk arrived out of order");
                }
                received += buf.len();
            }
            Ok::<_, stream_monitor::StreamMonitorError>(received)
        });

        writer.join().map_err(|_| "writer panicked")??;
        let received = reader.join().map_err(|_| "reader panicked")??;
        Ok::<_, Box<dyn std::error::Error>>(received)
    })?;

    let stats = server.stats();
    println!("Received {received} bytes");
    println!(
        "Writer submitted {} bytes in {} pieces",
        stats.bytes_submitted(),
        stats.submissions.len()
    );

    playback.destroy();
    capture.destroy();

    Ok(())
}
