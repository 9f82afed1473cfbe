//! Synthetic serial streams for testing
//!
//! Builds marker-framed byte streams with known payloads so decoded pixels
//! can be checked exactly, plus helpers for chopping a stream into the
//! uneven reads a real serial port produces.
//!
//! # Example
//!
//! ```rust,ignore
//! use serial_cam_lib::test_utils::{rgb565_frame, split_irregular, Rgb, StreamBuilder};
//!
//! let stream = StreamBuilder::new()
//!     .noise(b"boot banner\r\n")
//!     .frame(&rgb565_frame(160, 120, Rgb::RED))
//!     .build();
//! let reads = split_irregular(&stream, 7);
//! ```

use crate::marker_scan::Marker;
use crate::pixel_codec::ByteOrder;

/// RGB color for test patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    /// Red component (0-255)
    pub r: u8,
    /// Green component (0-255)
    pub g: u8,
    /// Blue component (0-255)
    pub b: u8,
}

impl Rgb {
    /// Pure red color
    pub const RED: Rgb = Rgb { r: 255, g: 0, b: 0 };
    /// Pure green color
    pub const GREEN: Rgb = Rgb { r: 0, g: 255, b: 0 };
    /// Pure blue color
    pub const BLUE: Rgb = Rgb { r: 0, g: 0, b: 255 };
    /// Pure white color
    pub const WHITE: Rgb = Rgb {
        r: 255,
        g: 255,
        b: 255,
    };
    /// Pure black color
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };
    /// Yellow color
    pub const YELLOW: Rgb = Rgb {
        r: 255,
        g: 255,
        b: 0,
    };
    /// Cyan color
    pub const CYAN: Rgb = Rgb {
        r: 0,
        g: 255,
        b: 255,
    };
    /// Magenta color
    pub const MAGENTA: Rgb = Rgb {
        r: 255,
        g: 0,
        b: 255,
    };

    /// Pack into a 5-6-5 cell
    pub fn to_rgb565(self) -> u16 {
        (u16::from(self.r >> 3) << 11) | (u16::from(self.g >> 2) << 5) | u16::from(self.b >> 3)
    }

    /// The two wire bytes of the packed cell
    pub fn to_rgb565_bytes(self, order: ByteOrder) -> [u8; 2] {
        match order {
            ByteOrder::BigEndian => self.to_rgb565().to_be_bytes(),
            ByteOrder::LittleEndian => self.to_rgb565().to_le_bytes(),
        }
    }

    /// The exact color after a 565 round trip
    pub fn quantized(self) -> [u8; 3] {
        crate::pixel_codec::expand_rgb565(self.to_rgb565())
    }
}

/// Big-endian RGB565 payload of one solid color
pub fn rgb565_frame(width: u32, height: u32, color: Rgb) -> Vec<u8> {
    rgb565_frame_with_order(width, height, color, ByteOrder::BigEndian)
}

/// RGB565 payload of one solid color in the given byte order
pub fn rgb565_frame_with_order(width: u32, height: u32, color: Rgb, order: ByteOrder) -> Vec<u8> {
    let cell = color.to_rgb565_bytes(order);
    let pixels = width as usize * height as usize;
    let mut frame = Vec::with_capacity(pixels * 2);
    for _ in 0..pixels {
        frame.extend_from_slice(&cell);
    }
    frame
}

/// Eight vertical color bars, big-endian RGB565
///
/// White, yellow, cyan, green, magenta, red, blue, black from left to right.
/// A swapped byte order or a column shift shows up as wrong bar colors.
pub fn rgb565_color_bars(width: u32, height: u32) -> Vec<u8> {
    let colors = color_bar_palette();
    let bar_width = (width / colors.len() as u32).max(1);
    let mut frame = Vec::with_capacity(width as usize * height as usize * 2);

    for _ in 0..height {
        for x in 0..width {
            let bar = ((x / bar_width) as usize).min(colors.len() - 1);
            frame.extend_from_slice(&colors[bar].to_rgb565_bytes(ByteOrder::BigEndian));
        }
    }
    frame
}

/// Color of bar `index` in [`rgb565_color_bars`]
pub fn color_bar_palette() -> [Rgb; 8] {
    [
        Rgb::WHITE,
        Rgb::YELLOW,
        Rgb::CYAN,
        Rgb::GREEN,
        Rgb::MAGENTA,
        Rgb::RED,
        Rgb::BLUE,
        Rgb::BLACK,
    ]
}

/// Horizontal gray ramp, big-endian RGB565
pub fn rgb565_gradient(width: u32, height: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(width as usize * height as usize * 2);
    for _ in 0..height {
        for x in 0..width {
            let v = ((x * 255) / width.saturating_sub(1).max(1)) as u8;
            frame.extend_from_slice(&Rgb { r: v, g: v, b: v }.to_rgb565_bytes(ByteOrder::BigEndian));
        }
    }
    frame
}

/// Mask rows as the device prints them, one `0`/`1` line per row
pub fn mask_text(rows: &[&[u8]]) -> Vec<u8> {
    let mut text = Vec::new();
    for row in rows {
        text.extend(row.iter().map(|&v| if v == 0 { b'0' } else { b'1' }));
        text.push(b'\n');
    }
    text
}

/// Builds a byte stream of marker-framed payloads and interleaved garbage
#[derive(Debug, Clone)]
pub struct StreamBuilder {
    start: Marker,
    end: Marker,
    bytes: Vec<u8>,
}

impl Default for StreamBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBuilder {
    /// Builder using the reference START/END markers
    pub fn new() -> Self {
        Self::with_markers(Marker::reference_start(), Marker::reference_end())
    }

    /// Builder using custom markers
    pub fn with_markers(start: Marker, end: Marker) -> Self {
        Self {
            start,
            end,
            bytes: Vec::new(),
        }
    }

    /// Raw bytes outside any frame
    #[must_use]
    pub fn noise(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// A complete `START payload END` frame
    #[must_use]
    pub fn frame(mut self, payload: &[u8]) -> Self {
        self.bytes.extend_from_slice(self.start.as_bytes());
        self.bytes.extend_from_slice(payload);
        self.bytes.extend_from_slice(self.end.as_bytes());
        self
    }

    /// A START and payload that never get an END
    #[must_use]
    pub fn unterminated(mut self, payload: &[u8]) -> Self {
        self.bytes.extend_from_slice(self.start.as_bytes());
        self.bytes.extend_from_slice(payload);
        self
    }

    /// An END with no matching START
    #[must_use]
    pub fn stray_end(mut self) -> Self {
        self.bytes.extend_from_slice(self.end.as_bytes());
        self
    }

    /// The stream so far
    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

/// Reference-marker stream containing each payload in order
pub fn frame_stream(payloads: &[Vec<u8>]) -> Vec<u8> {
    payloads
        .iter()
        .fold(StreamBuilder::new(), |b, p| b.frame(p))
        .build()
}

/// Split into fixed-size reads
pub fn split_fixed(data: &[u8], size: usize) -> Vec<Vec<u8>> {
    data.chunks(size.max(1)).map(<[u8]>::to_vec).collect()
}

/// Split into reads of 1..=max_len bytes, deterministic for a given seed
pub fn split_irregular(data: &[u8], seed: u64) -> Vec<Vec<u8>> {
    split_irregular_max(data, seed, 64)
}

/// Like [`split_irregular`] with a custom upper bound on read size
pub fn split_irregular_max(data: &[u8], seed: u64, max_len: usize) -> Vec<Vec<u8>> {
    let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    let mut out = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        // 64-bit LCG, high bits are the well-mixed ones
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let len = ((state >> 33) as usize % max_len.max(1)) + 1;
        let end = (pos + len).min(data.len());
        out.push(data[pos..end].to_vec());
        pos = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb565_packing() {
        assert_eq!(Rgb::RED.to_rgb565(), 0xF800);
        assert_eq!(Rgb::GREEN.to_rgb565(), 0x07E0);
        assert_eq!(Rgb::BLUE.to_rgb565_bytes(ByteOrder::BigEndian), [0x00, 0x1F]);
        assert_eq!(Rgb::BLUE.to_rgb565_bytes(ByteOrder::LittleEndian), [0x1F, 0x00]);
        assert_eq!(Rgb::WHITE.quantized(), [255, 255, 255]);
    }

    #[test]
    fn test_color_bars_layout() {
        let frame = rgb565_color_bars(16, 1);
        assert_eq!(frame.len(), 32);
        // Bar 5 (red) covers columns 10 and 11
        assert_eq!(&frame[20..24], &[0xF8, 0x00, 0xF8, 0x00]);
    }

    #[test]
    fn test_split_irregular_preserves_bytes() {
        let data: Vec<u8> = (0..=255).collect();
        let reads = split_irregular(&data, 42);
        assert!(reads.iter().all(|r| !r.is_empty() && r.len() <= 64));
        assert_eq!(reads.concat(), data);
        assert_eq!(reads, split_irregular(&data, 42));
    }

    #[test]
    fn test_stream_builder() {
        let stream = StreamBuilder::new().noise(b"x").frame(&[1, 2]).stray_end().build();
        assert_eq!(stream.len(), 1 + 4 + 2 + 4 + 4);
        assert_eq!(&stream[1..5], &Marker::REFERENCE_START);
    }
}
