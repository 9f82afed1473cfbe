//! Generates the RGB565 8x4 capture fixture.
//!
//! Run with: `cargo run --bin generate_rgb565_fixture`
//!
//! Writes `capture.bin` and `capture.json` under `tests/fixtures/rgb565_8x4/`.
//! The stream is what a freshly reset board would send:
//! - a boot banner (noise before the first START)
//! - Frame 0: eight one-pixel-wide color bars
//! - Frame 1: solid red
//! - the first half of Frame 2, cut off by the end of the capture
//!
//! The stream is cut into 17-byte reads, 1 ms apart, so markers straddle
//! read boundaries.

use std::fs::File;
use std::io::Write;
use std::path::Path;

const WIDTH: usize = 8;
const HEIGHT: usize = 4;
const START: [u8; 4] = [0xAA, 0x55, 0xAA, 0x55];
const END: [u8; 4] = [0x55, 0xAA, 0x55, 0xAA];
const READ_SIZE: usize = 17;

/// White, yellow, cyan, green, magenta, red, blue, black as RGB565.
const BARS: [u16; 8] = [
    0xFFFF, 0xFFE0, 0x07FF, 0x07E0, 0xF81F, 0xF800, 0x001F, 0x0000,
];

fn color_bars() -> Vec<u8> {
    let mut frame = Vec::with_capacity(WIDTH * HEIGHT * 2);
    for _ in 0..HEIGHT {
        for x in 0..WIDTH {
            frame.extend_from_slice(&BARS[x * BARS.len() / WIDTH].to_be_bytes());
        }
    }
    frame
}

fn solid(cell: u16) -> Vec<u8> {
    (0..WIDTH * HEIGHT).flat_map(|_| cell.to_be_bytes()).collect()
}

/// Write a chunk in the capture format.
fn write_chunk(file: &mut File, timestamp_us: u64, data: &[u8]) -> std::io::Result<()> {
    // Format: [u64 LE: timestamp_us][u32 LE: length][bytes]
    file.write_all(&timestamp_us.to_le_bytes())?;
    file.write_all(&(data.len() as u32).to_le_bytes())?;
    file.write_all(data)?;
    Ok(())
}

fn main() -> std::io::Result<()> {
    let fixture_dir = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("rgb565_8x4");
    std::fs::create_dir_all(&fixture_dir)?;

    let mut stream = b"cam ready\r\n".to_vec();
    for payload in [color_bars(), solid(0xF800)] {
        stream.extend_from_slice(&START);
        stream.extend_from_slice(&payload);
        stream.extend_from_slice(&END);
    }
    stream.extend_from_slice(&START);
    stream.extend_from_slice(&solid(0x001F)[..WIDTH * HEIGHT]);
    println!("Generated stream: {} bytes", stream.len());

    let output_path = fixture_dir.join("capture.bin");
    let mut file = File::create(&output_path)?;
    let mut total_chunks = 0u64;
    for (i, chunk) in stream.chunks(READ_SIZE).enumerate() {
        write_chunk(&mut file, i as u64 * 1000, chunk)?;
        total_chunks += 1;
    }
    file.flush()?;

    let metadata = format!(
        r#"{{
  "port": "/dev/ttyACM0",
  "baud": 921600,
  "width": {WIDTH},
  "height": {HEIGHT},
  "format": "rgb565",
  "byte_order": "big_endian",
  "start_marker": "AA55AA55",
  "end_marker": "55AA55AA",
  "total_chunks": {total_chunks},
  "total_frames": 2,
  "duration_ms": {},
  "total_bytes": {},
  "description": "8x4 color bars, solid red, truncated third frame"
}}
"#,
        (total_chunks - 1),
        stream.len()
    );
    std::fs::write(fixture_dir.join("capture.json"), metadata)?;

    println!(
        "Wrote {} chunks to {}",
        total_chunks,
        output_path.display()
    );
    Ok(())
}
