//! Example sensor consumer (fan-out reader)
//!
//! Registers its own ring buffer with a fan-out channel and polls the
//! latest frame at ~30 Hz, reporting sequence numbers and writer liveness.

use framelink::fanout;
use std::time::Duration;

const FRAME_SIZE: usize = 1024;

fn main() {
    let channel = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/sensor_channel".to_string());

    println!("[reader] channel: {}", channel);

    let reader = match fanout::Reader::new(&channel, FRAME_SIZE) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("[reader] failed to connect: {}", e);
            eprintln!("[reader] make sure the writer is running first");
            std::process::exit(1);
        }
    };

    println!(
        "[reader] registered ring '{}' ({} slots)",
        reader.ring_name(),
        reader.ring_size()
    );

    let mut last_seq = 0u64;
    loop {
        if let Some(frame) = reader.latest() {
            if frame.sequence != last_seq {
                if last_seq > 0 && frame.sequence > last_seq + 1 {
                    println!("[reader] missed {} frame(s)", frame.sequence - last_seq - 1);
                }
                last_seq = frame.sequence;

                if frame.sequence % 30 == 0 {
                    let mut first8 = [0u8; 8];
                    first8.copy_from_slice(&frame.payload[..8]);
                    println!(
                        "[reader] seq {} (app seq {}, {} bytes, total {})",
                        frame.sequence,
                        u64::from_le_bytes(first8),
                        frame.payload.len(),
                        reader.total_writes()
                    );
                }
            }
        }

        if !reader.is_writer_alive(Duration::from_secs(2)) {
            println!("[reader] writer heartbeat stale, exiting");
            break;
        }

        std::thread::sleep(Duration::from_millis(33));
    }

    println!("[reader] observed {} frames total", reader.total_writes());
}
