//! Rolling byte buffer and marker search
//!
//! Shared by the frame synchronizer (START/END markers) and the mask line
//! splitter (`\n` as a one-byte marker).
//!
//! The buffer keeps a read cursor instead of shifting bytes on every consume,
//! and only compacts once the consumed prefix dominates the backing storage.
//! [`MarkerScanner`] remembers how far the retained bytes have already been
//! searched so a one-byte-at-a-time feed does not rescan the whole buffer.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Consumed-prefix size at which the backing storage is compacted
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// A fixed, non-empty byte sequence used as a stream delimiter
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Marker(Vec<u8>);

impl Marker {
    /// Reference START marker: `AA 55 AA 55`
    pub const REFERENCE_START: [u8; 4] = [0xAA, 0x55, 0xAA, 0x55];
    /// Reference END marker: `55 AA 55 AA`
    pub const REFERENCE_END: [u8; 4] = [0x55, 0xAA, 0x55, 0xAA];
    /// JPEG Start Of Image
    pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
    /// JPEG End Of Image
    pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

    /// Create a marker, returning `None` for an empty sequence
    pub fn new(bytes: impl Into<Vec<u8>>) -> Option<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            None
        } else {
            Some(Self(bytes))
        }
    }

    /// Reference protocol START
    pub fn reference_start() -> Self {
        Self(Self::REFERENCE_START.to_vec())
    }

    /// Reference protocol END
    pub fn reference_end() -> Self {
        Self(Self::REFERENCE_END.to_vec())
    }

    /// JPEG SOI, used as START for JPEG payloads
    pub fn jpeg_soi() -> Self {
        Self(Self::JPEG_SOI.to_vec())
    }

    /// JPEG EOI, used as END for JPEG payloads
    pub fn jpeg_eoi() -> Self {
        Self(Self::JPEG_EOI.to_vec())
    }

    /// Single-byte marker, e.g. `b'\n'` for line framing
    pub fn byte(b: u8) -> Self {
        Self(vec![b])
    }

    /// Marker bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Marker length in bytes (never zero)
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Parse a hex string such as `"AA55AA55"` or `"aa 55 aa 55"`
    pub fn from_hex(s: &str) -> Option<Self> {
        let digits: Vec<u8> = s
            .bytes()
            .filter(|b| !b.is_ascii_whitespace() && *b != b':')
            .collect();
        if digits.len() % 2 != 0 {
            return None;
        }
        let bytes = digits
            .chunks_exact(2)
            .map(|pair| {
                let hi = (pair[0] as char).to_digit(16)?;
                let lo = (pair[1] as char).to_digit(16)?;
                Some((hi * 16 + lo) as u8)
            })
            .collect::<Option<Vec<u8>>>()?;
        Self::new(bytes)
    }

    /// Uppercase hex rendering without separators
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

impl fmt::Debug for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Marker({})", self.to_hex())
    }
}

impl Serialize for Marker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Marker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Marker::from_hex(&s).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid marker hex string '{}'", s))
        })
    }
}

/// Find the earliest occurrence of `needle` in `haystack`
#[inline]
pub fn find_marker(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Find the last occurrence of `needle` in `haystack`
#[inline]
pub fn rfind_marker(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Growable byte container with a read cursor
///
/// Bytes before the cursor are logically gone; they are physically dropped
/// on the next compaction.
#[derive(Debug, Default)]
pub struct RollingBuffer {
    data: Vec<u8>,
    consumed: usize,
    /// Absolute stream offset of `data[0]`
    base_offset: u64,
}

impl RollingBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with reserved capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            consumed: 0,
            base_offset: 0,
        }
    }

    /// Append bytes at the tail
    pub fn extend(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    /// Unconsumed bytes
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.consumed..]
    }

    /// Number of unconsumed bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.consumed
    }

    /// Whether there are no unconsumed bytes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute stream offset of the first unconsumed byte
    pub fn stream_offset(&self) -> u64 {
        self.base_offset + self.consumed as u64
    }

    /// Advance the read cursor by `n` bytes (clamped to what is buffered)
    pub fn consume(&mut self, n: usize) {
        self.consumed += n.min(self.len());

        if self.consumed == self.data.len() {
            self.base_offset += self.consumed as u64;
            self.data.clear();
            self.consumed = 0;
        } else if self.consumed >= COMPACT_THRESHOLD && self.consumed * 2 >= self.data.len() {
            self.base_offset += self.consumed as u64;
            self.data.drain(..self.consumed);
            self.consumed = 0;
        }
    }

    /// Copy out `range` (relative to the cursor) and consume through `consume_to`
    pub fn take(&mut self, range: std::ops::Range<usize>, consume_to: usize) -> Vec<u8> {
        let out = self.as_slice()[range].to_vec();
        self.consume(consume_to);
        out
    }

    /// Drop everything, keeping the absolute offset counting
    pub fn clear(&mut self) {
        let remaining = self.len();
        self.consume(remaining);
    }
}

/// Incremental search for one marker over a [`RollingBuffer`]
///
/// Tracks a resume point relative to the buffer cursor. Positions before the
/// resume point are known not to start a match, so they are never searched
/// again. The caller must report every consume via [`MarkerScanner::rebase`].
#[derive(Debug, Clone)]
pub struct MarkerScanner {
    marker: Marker,
    resume: usize,
}

impl MarkerScanner {
    /// Create a scanner for `marker`
    pub fn new(marker: Marker) -> Self {
        Self { marker, resume: 0 }
    }

    /// The marker being searched for
    pub fn marker(&self) -> &Marker {
        &self.marker
    }

    /// Find the earliest occurrence at or after the resume point
    pub fn find(&mut self, buf: &[u8]) -> Option<usize> {
        let from = self.resume.min(buf.len());
        match find_marker(&buf[from..], self.marker.as_bytes()) {
            Some(idx) => {
                self.resume = from + idx;
                Some(from + idx)
            }
            None => {
                // A match may still straddle the tail
                self.resume = buf.len().saturating_sub(self.marker.len() - 1);
                None
            }
        }
    }

    /// Never search before `pos`
    pub fn skip_to(&mut self, pos: usize) {
        self.resume = self.resume.max(pos);
    }

    /// Account for `n` bytes consumed from the front of the buffer
    pub fn rebase(&mut self, n: usize) {
        self.resume = self.resume.saturating_sub(n);
    }

    /// Forget all scan progress
    pub fn reset(&mut self) {
        self.resume = 0;
    }
}
