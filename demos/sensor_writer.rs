//! Example sensor publisher (fan-out writer)
//!
//! Creates a fan-out channel, waits for at least one reader to register,
//! then publishes synthetic sensor frames at ~30 Hz. The first 8 payload
//! bytes carry a little-endian application sequence number.

use framelink::fanout;
use std::time::Duration;

const FRAME_SIZE: usize = 1024;

fn main() {
    let channel = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/sensor_channel".to_string());
    let max_frames: u64 = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(u64::MAX);

    println!("[writer] channel: {} ({} bytes/frame)", channel, FRAME_SIZE);

    let mut writer = match fanout::Writer::new(&channel, FRAME_SIZE) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("[writer] failed to create channel: {}", e);
            std::process::exit(1);
        }
    };

    println!("[writer] waiting for readers...");
    while writer.reader_count() == 0 {
        std::thread::sleep(Duration::from_millis(200));
    }
    println!("[writer] {} reader(s) connected, publishing at 30 Hz", writer.reader_count());

    let mut frame = vec![0u8; FRAME_SIZE];
    let mut sequence = 0u64;

    while sequence < max_frames {
        frame[..8].copy_from_slice(&sequence.to_le_bytes());
        for (i, byte) in frame.iter_mut().enumerate().skip(8) {
            *byte = (sequence as usize + i) as u8;
        }

        let readers_written = writer.write(&frame).expect("frame fits the slot capacity");

        if sequence % 30 == 0 {
            println!("[writer] seq {} -> {} reader(s)", sequence, readers_written);
        }

        sequence += 1;
        std::thread::sleep(Duration::from_millis(33));
    }

    println!("[writer] done, {} frames published", sequence);
}
