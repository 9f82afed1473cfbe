//! Line-framed binary mask assembly
//!
//! Some firmware builds stream the thresholded mask as plain text with no
//! frame markers: one row of `0`/`1` per line, `height` rows per frame. This
//! module rebuilds frames from that stream, dropping any line that is not a
//! complete valid row (boot banners, partial rows after a reconnect).

use serde::Serialize;

use crate::marker_scan::{Marker, MarkerScanner, RollingBuffer};
use crate::pixel_codec::{is_valid_mask_row, trim_line, PixelFormat, PixelFrame};

/// Whitespace tolerated around a row before the line counts as overlong
const LINE_PADDING: usize = 16;

/// Row counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaskStats {
    /// Frames emitted
    pub frames: u64,
    /// Rows accepted into a frame
    pub rows_accepted: u64,
    /// Lines dropped as invalid
    pub rows_dropped: u64,
}

/// Accumulates newline-delimited mask rows into frames
#[derive(Debug)]
pub struct MaskAssembler {
    width: u32,
    height: u32,
    buffer: RollingBuffer,
    newline: MarkerScanner,
    rows: Vec<u8>,
    rows_filled: u32,
    /// Current line already exceeded the row length and was partly discarded
    overlong: bool,
    stats: MaskStats,
}

impl MaskAssembler {
    /// Create an assembler for `width`×`height` masks
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            buffer: RollingBuffer::new(),
            newline: MarkerScanner::new(Marker::byte(b'\n')),
            rows: Vec::with_capacity(width as usize * height as usize),
            rows_filled: 0,
            overlong: false,
            stats: MaskStats::default(),
        }
    }

    /// Counters since creation
    pub fn stats(&self) -> MaskStats {
        self.stats
    }

    /// Valid rows collected toward the next frame
    pub fn rows_pending(&self) -> u32 {
        self.rows_filled
    }

    /// Drop any partial line and partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.newline.reset();
        self.rows.clear();
        self.rows_filled = 0;
        self.overlong = false;
    }

    /// Append bytes and return every frame completed by them
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<PixelFrame> {
        self.buffer.extend(chunk);
        let mut frames = Vec::new();

        while let Some(idx) = self.newline.find(self.buffer.as_slice()) {
            let line = self.buffer.take(0..idx, idx + 1);
            self.newline.rebase(idx + 1);

            if std::mem::take(&mut self.overlong) {
                self.stats.rows_dropped += 1;
                continue;
            }
            if let Some(frame) = self.push_line(&line) {
                frames.push(frame);
            }
        }

        // No newline in sight and already too long for a padded row
        let max_line = self.width as usize + LINE_PADDING;
        if self.buffer.len() > max_line {
            log::debug!("Discarding {} bytes of overlong mask line", self.buffer.len());
            self.buffer.clear();
            self.newline.reset();
            self.overlong = true;
        }

        frames
    }

    fn push_line(&mut self, line: &[u8]) -> Option<PixelFrame> {
        let line = trim_line(line);
        if line.is_empty() {
            return None;
        }
        if !is_valid_mask_row(line, self.width) {
            self.stats.rows_dropped += 1;
            return None;
        }

        self.rows.extend(line.iter().map(|&c| c - b'0'));
        self.rows_filled += 1;
        self.stats.rows_accepted += 1;

        if self.rows_filled < self.height {
            return None;
        }

        let data = std::mem::replace(
            &mut self.rows,
            Vec::with_capacity(self.width as usize * self.height as usize),
        );
        self.rows_filled = 0;

        // Length is guaranteed by row validation
        let mut frame = PixelFrame::new(self.width, self.height, PixelFormat::BinaryMask, data).ok()?;
        frame.sequence = self.stats.frames;
        self.stats.frames += 1;
        log::debug!("Mask frame {} complete", frame.sequence);
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_valid_rows_count() {
        let mut asm = MaskAssembler::new(4, 2);
        // too short, invalid char, valid
        let frames = asm.feed(b"010\n0120\n0110\n");
        assert!(frames.is_empty());
        assert_eq!(asm.rows_pending(), 1);
        assert_eq!(asm.stats().rows_dropped, 2);

        let frames = asm.feed(b"1001\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, vec![0, 1, 1, 0, 1, 0, 0, 1]);
        assert_eq!(frames[0].format, PixelFormat::BinaryMask);
        assert_eq!(asm.rows_pending(), 0);
    }

    #[test]
    fn test_rows_split_across_chunks() {
        let mut asm = MaskAssembler::new(4, 1);
        assert!(asm.feed(b"11").is_empty());
        assert!(asm.feed(b"00\r").is_empty());
        let frames = asm.feed(b"\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut asm = MaskAssembler::new(2, 1);
        let frames = asm.feed(b"10\n01\n11\n");
        assert_eq!(frames.len(), 3);
        let seqs: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(asm.stats().frames, 3);
    }

    #[test]
    fn test_overlong_line_is_dropped_whole() {
        let mut asm = MaskAssembler::new(4, 1);
        assert!(asm.feed(&[b'0'; 24]).is_empty());
        // Tail of the overlong line must not become a valid row
        assert!(asm.feed(b"0101\n").is_empty());
        assert_eq!(asm.stats().rows_dropped, 1);

        let frames = asm.feed(b"1111\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_rows_with_surrounding_whitespace() {
        let mut asm = MaskAssembler::new(4, 3);
        let frames = asm.feed(b"  1100\r\n\t0011 \n0110\r\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, vec![1, 1, 0, 0, 0, 0, 1, 1, 0, 1, 1, 0]);
        assert_eq!(asm.stats().rows_dropped, 0);

        // Inner whitespace still breaks the row
        assert!(asm.feed(b"01 10\n").is_empty());
        assert_eq!(asm.stats().rows_dropped, 1);
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut asm = MaskAssembler::new(2, 2);
        asm.feed(b"11\n0");
        asm.reset();
        assert_eq!(asm.rows_pending(), 0);
        let frames = asm.feed(b"00\n00\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, vec![0, 0, 0, 0]);
    }
}
