//! Frame synchronization over a marker-delimited serial byte stream
//!
//! The camera link has no transport framing: the device writes
//! `START || payload || END` back to back and the host has to find the
//! boundaries in whatever chunks the serial driver hands over.
//!
//! # Usage
//!
//! ```rust,ignore
//! use serial_cam_lib::frame_sync::{FrameSynchronizer, SyncConfig, SyncResult};
//!
//! let mut sync = FrameSynchronizer::new(SyncConfig::reference());
//!
//! for chunk in serial_chunks {
//!     sync.feed(&chunk);
//!     while let Some(result) = sync.next_result() {
//!         if let SyncResult::Frame(frame) = result {
//!             decode(frame.payload);
//!         }
//!     }
//! }
//! ```

use std::ops::Range;

use serde::Serialize;

use crate::marker_scan::{rfind_marker, Marker, MarkerScanner, RollingBuffer};

/// Synchronizer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    /// Looking for the next START marker
    SeekingStart,
    /// START consumed, accumulating payload until END
    SeekingEnd,
}

/// Marker configuration for the synchronizer
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Frame start marker
    pub start: Marker,
    /// Frame end marker
    pub end: Marker,
    /// Keep both markers in the emitted payload (JPEG SOI/EOI framing)
    pub include_markers: bool,
    /// Give up on a frame whose payload grows past this many bytes (0 = unbounded)
    pub max_payload_len: usize,
}

impl SyncConfig {
    /// Reference camera protocol: `AA55AA55 … 55AA55AA`, markers stripped
    pub fn reference() -> Self {
        Self {
            start: Marker::reference_start(),
            end: Marker::reference_end(),
            include_markers: false,
            max_payload_len: 0,
        }
    }

    /// JPEG capture: `FFD8 … FFD9`, markers kept so the payload is a complete JPEG
    pub fn jpeg() -> Self {
        Self {
            start: Marker::jpeg_soi(),
            end: Marker::jpeg_eoi(),
            include_markers: true,
            max_payload_len: 0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::reference()
    }
}

/// A payload located between a START and its END
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Sequence number of the emitted frame, starting at 0
    pub sequence: u64,
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Absolute stream offsets consumed for this frame, START through END
    pub provenance: Range<u64>,
}

impl RawFrame {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty (START immediately followed by END)
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Why bytes were thrown away without emitting a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    /// An END marker arrived before any START
    Ordering {
        /// Bytes discarded, stray END included
        discarded: usize,
    },
    /// No END within `max_payload_len`; the partial frame was abandoned
    Oversized {
        /// Bytes discarded
        discarded: usize,
    },
}

/// Result of one extraction attempt
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResult {
    /// Not enough data yet
    Pending,
    /// Complete frame located
    Frame(RawFrame),
    /// Corrupted ordering or runaway payload; resynchronized, no frame
    Malformed(Malformed),
}

/// Running counters for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Frames emitted
    pub frames: u64,
    /// Stray END markers discarded
    pub malformed_ordering: u64,
    /// Partial payloads dropped because a newer START arrived before END
    pub abandoned: u64,
    /// Partial payloads dropped for exceeding `max_payload_len`
    pub oversized: u64,
    /// Bytes thrown away outside of emitted frames
    pub bytes_discarded: u64,
}

/// Recovers marker-delimited frames from an unframed byte stream
#[derive(Debug)]
pub struct FrameSynchronizer {
    config: SyncConfig,
    buffer: RollingBuffer,
    state: SyncState,
    start_scan: MarkerScanner,
    end_scan: MarkerScanner,
    /// Absolute offset of the START marker for the frame in progress
    frame_origin: u64,
    stats: SyncStats,
}

impl FrameSynchronizer {
    /// Create a synchronizer in `SeekingStart`
    pub fn new(config: SyncConfig) -> Self {
        let start_scan = MarkerScanner::new(config.start.clone());
        let end_scan = MarkerScanner::new(config.end.clone());
        Self {
            config,
            buffer: RollingBuffer::with_capacity(64 * 1024),
            state: SyncState::SeekingStart,
            start_scan,
            end_scan,
            frame_origin: 0,
            stats: SyncStats::default(),
        }
    }

    /// Marker configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Retained (unconsumed) bytes
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Counters since creation
    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Drop all buffered bytes and go back to `SeekingStart`
    ///
    /// Call this when the transport reconnects: a payload interrupted by the
    /// disconnect can never be completed and must not leak into the next frame.
    pub fn reset(&mut self) {
        let dropped = self.buffer.len();
        if dropped > 0 {
            log::debug!("Synchronizer reset, dropping {} buffered bytes", dropped);
        }
        self.stats.bytes_discarded += dropped as u64;
        self.buffer.clear();
        self.start_scan.reset();
        self.end_scan.reset();
        self.state = SyncState::SeekingStart;
    }

    /// Append a chunk read from the byte source
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend(chunk);
    }

    /// Like [`try_extract_frame`](Self::try_extract_frame) but `None` instead of `Pending`
    pub fn next_result(&mut self) -> Option<SyncResult> {
        match self.try_extract_frame() {
            SyncResult::Pending => None,
            other => Some(other),
        }
    }

    /// Try to pull one complete frame out of the buffered bytes
    pub fn try_extract_frame(&mut self) -> SyncResult {
        loop {
            match self.state {
                SyncState::SeekingStart => {
                    if let Some(result) = self.seek_start() {
                        return result;
                    }
                }
                SyncState::SeekingEnd => return self.seek_end(),
            }
        }
    }

    /// Returns `None` after transitioning to `SeekingEnd`
    fn seek_start(&mut self) -> Option<SyncResult> {
        let start_len = self.config.start.len();
        let end_len = self.config.end.len();

        let buf = self.buffer.as_slice();
        let start = self.start_scan.find(buf);
        let end = self.end_scan.find(buf);

        // END wholly before the first START: ordering is corrupted. An END that
        // overlaps the START's bytes is just the START seen through a stray byte.
        if let Some(end_idx) = end {
            let stray = match start {
                Some(start_idx) => end_idx + end_len <= start_idx,
                // Only certain once any START overlapping this END would be complete
                None => buf.len() >= end_idx + end_len + start_len - 1,
            };
            if stray {
                let discarded = end_idx + end_len;
                log::warn!(
                    "END marker before START at stream offset {} - resynchronizing ({} bytes discarded)",
                    self.buffer.stream_offset() + end_idx as u64,
                    discarded
                );
                self.discard(discarded);
                self.stats.malformed_ordering += 1;
                return Some(SyncResult::Malformed(Malformed::Ordering { discarded }));
            }
        }

        let start_idx = match start {
            Some(idx) => idx,
            None => {
                if end.is_none() {
                    // Pure noise: only a straddling marker prefix is worth keeping
                    let keep = start_len.max(end_len) - 1;
                    let noise = self.buffer.len().saturating_sub(keep);
                    if noise > 0 {
                        self.discard(noise);
                    }
                }
                return Some(SyncResult::Pending);
            }
        };

        if start_idx > 0 {
            log::debug!("Skipping {} bytes of noise before START", start_idx);
            self.discard(start_idx);
        }
        self.frame_origin = self.buffer.stream_offset();

        if self.config.include_markers {
            // Keep START in the buffer; END may not overlap it
            self.end_scan.reset();
            self.end_scan.skip_to(start_len);
        } else {
            self.advance(start_len);
            self.end_scan.reset();
        }
        self.start_scan.reset();
        self.state = SyncState::SeekingEnd;
        None
    }

    fn seek_end(&mut self) -> SyncResult {
        let start_len = self.config.start.len();
        let end_len = self.config.end.len();
        let payload_from = if self.config.include_markers {
            start_len
        } else {
            0
        };

        let buf = self.buffer.as_slice();
        let end_idx = match self.end_scan.find(buf) {
            Some(idx) => idx,
            None => return self.check_oversized(payload_from),
        };

        // A START inside the window means the previous one was never closed
        let nested = rfind_marker(&buf[payload_from..end_idx], self.config.start.as_bytes())
            .map(|idx| payload_from + idx);

        let frame_begin = match nested {
            Some(restart) => {
                let abandoned = if self.config.include_markers {
                    restart
                } else {
                    restart + start_len
                };
                log::warn!(
                    "START without END at stream offset {} - abandoning {} byte partial frame",
                    self.frame_origin,
                    abandoned
                );
                self.stats.abandoned += 1;
                self.stats.bytes_discarded += abandoned as u64;
                self.frame_origin = self.buffer.stream_offset() + restart as u64;
                restart
            }
            None => 0,
        };

        let payload_range = if self.config.include_markers {
            frame_begin..end_idx + end_len
        } else if nested.is_some() {
            frame_begin + start_len..end_idx
        } else {
            0..end_idx
        };

        let consumed = end_idx + end_len;
        let provenance = self.frame_origin..self.buffer.stream_offset() + consumed as u64;
        let payload = self.buffer.take(payload_range, consumed);
        self.start_scan.rebase(consumed);
        self.end_scan.rebase(consumed);
        self.state = SyncState::SeekingStart;

        let frame = RawFrame {
            sequence: self.stats.frames,
            payload,
            provenance,
        };
        self.stats.frames += 1;
        log::debug!(
            "Frame {}: {} payload bytes (stream {}..{})",
            frame.sequence,
            frame.len(),
            frame.provenance.start,
            frame.provenance.end
        );
        SyncResult::Frame(frame)
    }

    fn check_oversized(&mut self, payload_from: usize) -> SyncResult {
        let limit = self.config.max_payload_len;
        let pending = self.buffer.len().saturating_sub(payload_from);
        // Allow room for an END that is still straddling the tail
        if limit == 0 || pending <= limit + self.config.end.len() {
            return SyncResult::Pending;
        }

        let start_len = self.config.start.len();
        let restart = rfind_marker(
            &self.buffer.as_slice()[payload_from..],
            self.config.start.as_bytes(),
        )
        .map(|idx| payload_from + idx);

        self.stats.oversized += 1;
        let discarded = match restart {
            Some(idx) => {
                // Resynchronize on the newer START and keep seeking END
                self.discard(idx);
                self.frame_origin = self.buffer.stream_offset();
                if self.config.include_markers {
                    self.end_scan.reset();
                    self.end_scan.skip_to(start_len);
                } else {
                    self.advance(start_len);
                    self.end_scan.reset();
                }
                idx
            }
            None => {
                // Keep a tail that might hold the beginning of the next START
                let keep = start_len - 1;
                let drop = self.buffer.len() - keep.min(self.buffer.len());
                self.discard(drop);
                self.start_scan.reset();
                self.state = SyncState::SeekingStart;
                drop
            }
        };

        log::warn!(
            "No END within {} payload bytes - abandoned frame ({} bytes discarded)",
            limit,
            discarded
        );
        SyncResult::Malformed(Malformed::Oversized { discarded })
    }

    /// Consume bytes that belong to no frame
    fn discard(&mut self, n: usize) {
        self.stats.bytes_discarded += n as u64;
        self.advance(n);
    }

    /// Consume bytes and keep the scanners aligned with the cursor
    fn advance(&mut self, n: usize) {
        self.buffer.consume(n);
        self.start_scan.rebase(n);
        self.end_scan.rebase(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: [u8; 4] = Marker::REFERENCE_START;
    const END: [u8; 4] = Marker::REFERENCE_END;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut out = START.to_vec();
        out.extend_from_slice(payload);
        out.extend_from_slice(&END);
        out
    }

    fn drain(sync: &mut FrameSynchronizer) -> Vec<SyncResult> {
        let mut out = Vec::new();
        while let Some(result) = sync.next_result() {
            out.push(result);
        }
        out
    }

    fn payloads(results: &[SyncResult]) -> Vec<Vec<u8>> {
        results
            .iter()
            .filter_map(|r| match r {
                SyncResult::Frame(f) => Some(f.payload.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_empty_buffer_is_pending() {
        let mut sync = FrameSynchronizer::new(SyncConfig::reference());
        assert_eq!(sync.try_extract_frame(), SyncResult::Pending);
        assert_eq!(sync.state(), SyncState::SeekingStart);
    }

    #[test]
    fn test_single_frame() {
        let mut sync = FrameSynchronizer::new(SyncConfig::reference());
        sync.feed(&framed(&[1, 2, 3, 4]));

        match sync.try_extract_frame() {
            SyncResult::Frame(frame) => {
                assert_eq!(frame.payload, vec![1, 2, 3, 4]);
                assert_eq!(frame.sequence, 0);
                assert_eq!(frame.provenance, 0..12);
            }
            other => panic!("expected frame, got {:?}", other),
        }
        assert_eq!(sync.state(), SyncState::SeekingStart);
        assert_eq!(sync.buffer_len(), 0);
    }

    #[test]
    fn test_noise_before_start_is_skipped() {
        let mut sync = FrameSynchronizer::new(SyncConfig::reference());
        let mut stream = b"Capturing...\r\n".to_vec();
        stream.extend(framed(&[9, 9]));
        sync.feed(&stream);

        let results = drain(&mut sync);
        assert_eq!(payloads(&results), vec![vec![9, 9]]);
        assert_eq!(sync.stats().bytes_discarded, 14);
    }

    #[test]
    fn test_partial_start_is_retained() {
        let mut sync = FrameSynchronizer::new(SyncConfig::reference());
        sync.feed(&[0x00, 0xAA, 0x55]);
        assert_eq!(sync.try_extract_frame(), SyncResult::Pending);
        assert_eq!(sync.buffer_len(), 3, "bytes before a confirmed match are kept");

        sync.feed(&[0xAA, 0x55, 7]);
        assert_eq!(sync.try_extract_frame(), SyncResult::Pending);
        assert_eq!(sync.state(), SyncState::SeekingEnd);

        sync.feed(&END);
        assert_eq!(payloads(&drain(&mut sync)), vec![vec![7]]);
    }

    #[test]
    fn test_one_byte_feed_matches_bulk_feed() {
        let mut stream = Vec::new();
        for i in 0..5u8 {
            stream.extend(framed(&[i; 10]));
            stream.extend_from_slice(b"\r\n");
        }

        let mut bulk = FrameSynchronizer::new(SyncConfig::reference());
        bulk.feed(&stream);
        let expected = payloads(&drain(&mut bulk));
        assert_eq!(expected.len(), 5);

        let mut trickle = FrameSynchronizer::new(SyncConfig::reference());
        let mut got = Vec::new();
        for byte in &stream {
            trickle.feed(std::slice::from_ref(byte));
            got.extend(payloads(&drain(&mut trickle)));
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn test_stray_end_resynchronizes() {
        let mut stream = framed(b"AAAA");
        stream.extend_from_slice(&END);
        stream.extend(framed(b"BBBB"));

        let mut sync = FrameSynchronizer::new(SyncConfig::reference());
        sync.feed(&stream);
        let results = drain(&mut sync);

        assert_eq!(results.len(), 3);
        assert!(matches!(
            results[1],
            SyncResult::Malformed(Malformed::Ordering { discarded: 4 })
        ));
        assert_eq!(payloads(&results), vec![b"AAAA".to_vec(), b"BBBB".to_vec()]);
        assert_eq!(sync.stats().malformed_ordering, 1);
    }

    #[test]
    fn test_end_overlapping_start_is_not_stray() {
        // A stray 0x55 before START makes "55 AA 55 AA" appear at offset 0
        let mut stream = vec![0x55];
        stream.extend(framed(&[1, 2]));

        let mut sync = FrameSynchronizer::new(SyncConfig::reference());
        sync.feed(&stream);
        let results = drain(&mut sync);
        assert_eq!(results, vec![SyncResult::Frame(RawFrame {
            sequence: 0,
            payload: vec![1, 2],
            provenance: 1..11,
        })]);
    }

    #[test]
    fn test_end_without_start_waits_for_overlap_window() {
        let mut sync = FrameSynchronizer::new(SyncConfig::reference());
        // Could be the tail of "55" + START, so not yet classified
        sync.feed(&END);
        assert_eq!(sync.try_extract_frame(), SyncResult::Pending);

        sync.feed(&[0x00, 0x00, 0x00]);
        assert_eq!(
            sync.try_extract_frame(),
            SyncResult::Malformed(Malformed::Ordering { discarded: 4 })
        );
    }

    #[test]
    fn test_nested_start_abandons_partial_payload() {
        let mut stream = START.to_vec();
        stream.extend_from_slice(b"partial");
        stream.extend(framed(b"whole"));

        let mut sync = FrameSynchronizer::new(SyncConfig::reference());
        sync.feed(&stream);
        let results = drain(&mut sync);

        assert_eq!(payloads(&results), vec![b"whole".to_vec()]);
        assert_eq!(sync.stats().abandoned, 1);
        match &results[0] {
            SyncResult::Frame(f) => assert_eq!(f.provenance, 11..24),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reset_drops_partial_payload() {
        let mut sync = FrameSynchronizer::new(SyncConfig::reference());
        sync.feed(&START);
        sync.feed(b"half a fra");
        assert_eq!(sync.try_extract_frame(), SyncResult::Pending);
        assert_eq!(sync.state(), SyncState::SeekingEnd);

        sync.reset();
        assert_eq!(sync.state(), SyncState::SeekingStart);
        assert_eq!(sync.buffer_len(), 0);

        sync.feed(&framed(b"fresh"));
        assert_eq!(payloads(&drain(&mut sync)), vec![b"fresh".to_vec()]);
    }

    #[test]
    fn test_oversized_payload_is_abandoned() {
        let config = SyncConfig {
            max_payload_len: 16,
            ..SyncConfig::reference()
        };
        let mut sync = FrameSynchronizer::new(config);
        sync.feed(&START);
        sync.feed(&[0x11; 32]);

        assert!(matches!(
            sync.try_extract_frame(),
            SyncResult::Malformed(Malformed::Oversized { .. })
        ));
        assert_eq!(sync.state(), SyncState::SeekingStart);
        assert!(sync.buffer_len() < START.len());

        sync.feed(&framed(&[1; 8]));
        assert_eq!(payloads(&drain(&mut sync)), vec![vec![1; 8]]);
    }

    #[test]
    fn test_jpeg_markers_are_kept() {
        let mut sync = FrameSynchronizer::new(SyncConfig::jpeg());
        sync.feed(&[0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x00]);

        let results = drain(&mut sync);
        assert_eq!(
            payloads(&results),
            vec![vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]]
        );
    }

    #[test]
    fn test_jpeg_end_cannot_overlap_start() {
        // FF D8 D9 would match FFD9 only if END could reuse START's FF
        let mut sync = FrameSynchronizer::new(SyncConfig::jpeg());
        sync.feed(&[0xFF, 0xD8, 0xD9, 0x10, 0xFF, 0xD9]);
        assert_eq!(
            payloads(&drain(&mut sync)),
            vec![vec![0xFF, 0xD8, 0xD9, 0x10, 0xFF, 0xD9]]
        );
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut sync = FrameSynchronizer::new(SyncConfig::reference());
        sync.feed(&framed(&[1]));
        sync.feed(&framed(&[2]));
        let seqs: Vec<u64> = drain(&mut sync)
            .into_iter()
            .filter_map(|r| match r {
                SyncResult::Frame(f) => Some(f.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![0, 1]);
    }
}
