//! Payload to pixel conversion
//!
//! Turns a synchronized payload into a [`PixelFrame`] whose buffer length is
//! guaranteed to match its declared dimensions.
//!
//! # Supported payload formats
//!
//! - **RGB565**: packed 16-bit cells, byte order configurable, expanded to
//!   RGB888 by bit replication
//! - **RGB888**: pass-through
//! - **JPEG**: complete `FFD8 … FFD9` image, decoded with `jpeg-decoder`
//! - **Mask**: ASCII rows of `0`/`1`, one row per line
//!
//! Size reconciliation runs before conversion: long payloads are truncated,
//! short ones are rejected or zero-padded depending on [`ShortFramePolicy`].

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sink::SinkKind;

/// Decode failures. Both are recoverable: skip the frame and keep going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Payload size does not fit the declared geometry after reconciliation
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Expected byte count (or pixel count for JPEG dimensions)
        expected: usize,
        /// Actual byte count
        actual: usize,
    },
    /// Structural violation inside the payload
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Result type for decode operations
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Encoding of the bytes between START and END
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// 16-bit 5/6/5 packed color
    #[default]
    Rgb565,
    /// 24-bit R-G-B
    Rgb888,
    /// Baseline JPEG image
    Jpeg,
    /// ASCII `0`/`1` rows
    Mask,
}

impl PayloadFormat {
    /// Bytes per pixel on the wire, `None` for compressed formats
    pub fn wire_bytes_per_pixel(self) -> Option<usize> {
        match self {
            PayloadFormat::Rgb565 => Some(2),
            PayloadFormat::Rgb888 => Some(3),
            PayloadFormat::Mask => Some(1),
            PayloadFormat::Jpeg => None,
        }
    }

    /// Pixel format produced after decoding
    pub fn output_format(self) -> PixelFormat {
        match self {
            PayloadFormat::Mask => PixelFormat::BinaryMask,
            _ => PixelFormat::Rgb888,
        }
    }

    /// Parse a format name from an environment variable
    ///
    /// Unknown values log a warning and fall back to RGB565.
    pub fn from_env_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "rgb565" | "565" | "raw" => PayloadFormat::Rgb565,
            "rgb888" | "rgb" | "888" => PayloadFormat::Rgb888,
            "jpeg" | "jpg" => PayloadFormat::Jpeg,
            "mask" | "binary" => PayloadFormat::Mask,
            other => {
                log::warn!("Unknown payload format '{}', using rgb565", other);
                PayloadFormat::Rgb565
            }
        }
    }
}

/// Order of the two bytes inside an RGB565 cell
///
/// Device variants disagree on this, so it is always explicit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// High byte first
    #[default]
    BigEndian,
    /// Low byte first
    LittleEndian,
}

impl ByteOrder {
    /// Parse a byte order name from an environment variable
    ///
    /// Unknown values log a warning and fall back to big-endian.
    pub fn from_env_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "big" | "be" | "big_endian" | "msb" | "high_first" => ByteOrder::BigEndian,
            "little" | "le" | "little_endian" | "lsb" | "low_first" => ByteOrder::LittleEndian,
            other => {
                log::warn!("Unknown byte order '{}', using big_endian", other);
                ByteOrder::BigEndian
            }
        }
    }

    #[inline]
    fn cell(self, pair: &[u8]) -> u16 {
        match self {
            ByteOrder::BigEndian => u16::from_be_bytes([pair[0], pair[1]]),
            ByteOrder::LittleEndian => u16::from_le_bytes([pair[0], pair[1]]),
        }
    }
}

/// What to do with a payload shorter than expected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortFramePolicy {
    /// Drop the frame with [`DecodeError::SizeMismatch`]
    Reject,
    /// Zero-fill the missing tail
    Pad,
}

impl ShortFramePolicy {
    /// Reject for live preview, pad for capture-to-file
    pub fn default_for(kind: SinkKind) -> Self {
        match kind {
            SinkKind::Preview => ShortFramePolicy::Reject,
            SinkKind::File => ShortFramePolicy::Pad,
        }
    }

    /// Parse a policy name from an environment variable
    ///
    /// Returns `None` for unknown values after logging a warning, so the
    /// caller keeps its sink-dependent default.
    pub fn from_env_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "reject" | "drop" | "skip" => Some(ShortFramePolicy::Reject),
            "pad" | "zero" | "fill" => Some(ShortFramePolicy::Pad),
            other => {
                log::warn!("Unknown short frame policy '{}', keeping default", other);
                None
            }
        }
    }
}

/// Size correction applied to a payload before conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SizeAdjustment {
    /// Trailing bytes removed
    Truncated {
        /// Number of bytes dropped
        dropped: usize,
    },
    /// Zero bytes (or zero rows for masks) appended
    Padded {
        /// Number of bytes added
        added: usize,
    },
}

/// Pixel layout of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 3 bytes per pixel, R-G-B
    Rgb888,
    /// 1 byte per pixel, each `0` or `1`
    BinaryMask,
}

impl PixelFormat {
    /// Bytes per pixel in the decoded buffer
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb888 => 3,
            PixelFormat::BinaryMask => 1,
        }
    }
}

/// A decoded frame
///
/// `data.len() == width * height * format.bytes_per_pixel()` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFrame {
    /// Sequence number carried over from the synchronizer
    pub sequence: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel layout
    pub format: PixelFormat,
    /// Flat pixel buffer, row-major
    pub data: Vec<u8>,
}

impl PixelFrame {
    /// Build a frame, checking the buffer length against the geometry
    ///
    /// # Errors
    /// Returns [`DecodeError::SizeMismatch`] if the buffer length is wrong.
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(DecodeError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            sequence: 0,
            width,
            height,
            format,
            data,
        })
    }

    /// Pixel value at (x, y); 3 bytes for RGB888, 1 byte for masks
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let idx = (y as usize * self.width as usize + x as usize) * bpp;
        self.data.get(idx..idx + bpp)
    }
}

/// Codec options that are protocol configuration rather than geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Byte order of RGB565 cells
    pub byte_order: ByteOrder,
    /// Handling of short payloads
    pub short_frame: ShortFramePolicy,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::default(),
            short_frame: ShortFramePolicy::default_for(SinkKind::Preview),
        }
    }
}

/// Successful decode plus any size correction that was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// The frame
    pub frame: PixelFrame,
    /// Set when the payload was truncated or padded
    pub adjustment: Option<SizeAdjustment>,
}

/// Decoder bound to one geometry and payload format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelCodec {
    width: u32,
    height: u32,
    format: PayloadFormat,
    options: DecodeOptions,
}

impl PixelCodec {
    /// Create a codec for `width`×`height` frames
    pub fn new(width: u32, height: u32, format: PayloadFormat, options: DecodeOptions) -> Self {
        Self {
            width,
            height,
            format,
            options,
        }
    }

    /// Expected payload size in bytes (0 for JPEG, which is variable)
    ///
    /// Masks expect `height` rows of `width` characters plus newlines.
    pub fn expected_size(&self) -> usize {
        expected_payload_size(self.width, self.height, self.format)
    }

    /// Payload format
    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    /// Decode options
    pub fn options(&self) -> DecodeOptions {
        self.options
    }

    /// Decode one payload
    ///
    /// # Errors
    /// Returns [`DecodeError`] when the payload cannot produce a frame of the
    /// configured geometry.
    pub fn decode(&self, payload: &[u8]) -> Result<Decoded> {
        decode(
            payload,
            self.expected_size(),
            self.width,
            self.height,
            self.format,
            self.options,
        )
    }
}

/// Expected payload size for a geometry and format
pub fn expected_payload_size(width: u32, height: u32, format: PayloadFormat) -> usize {
    let pixels = width as usize * height as usize;
    match format {
        PayloadFormat::Mask => (width as usize + 1) * height as usize,
        PayloadFormat::Jpeg => 0,
        other => pixels * other.wire_bytes_per_pixel().unwrap_or(0),
    }
}

/// Decode `payload` into a `width`×`height` frame
///
/// `expected_size` drives size reconciliation for the raw formats; it is
/// ignored for JPEG and masks, which are validated structurally.
///
/// # Errors
/// - [`DecodeError::MalformedPayload`] for an odd RGB565 cell stream, invalid
///   mask text or an undecodable JPEG
/// - [`DecodeError::SizeMismatch`] when the payload does not fit the geometry
///   after the short-frame policy is applied
pub fn decode(
    payload: &[u8],
    expected_size: usize,
    width: u32,
    height: u32,
    format: PayloadFormat,
    options: DecodeOptions,
) -> Result<Decoded> {
    match format {
        PayloadFormat::Rgb565 => {
            // A short odd payload lost a byte mid-cell; the cell alignment is unknown
            if payload.len() % 2 != 0 && payload.len() <= expected_size {
                return Err(DecodeError::MalformedPayload(format!(
                    "odd RGB565 payload length {}",
                    payload.len()
                )));
            }
            let (data, adjustment) = reconcile_size(payload, expected_size, options.short_frame)?;
            check_len(&data, width, height, 2)?;
            let rgb = rgb565_to_rgb888(&data, options.byte_order)?;
            let frame = PixelFrame::new(width, height, PixelFormat::Rgb888, rgb)?;
            Ok(Decoded { frame, adjustment })
        }
        PayloadFormat::Rgb888 => {
            let (data, adjustment) = reconcile_size(payload, expected_size, options.short_frame)?;
            check_len(&data, width, height, 3)?;
            let frame = PixelFrame::new(width, height, PixelFormat::Rgb888, data.into_owned())?;
            Ok(Decoded { frame, adjustment })
        }
        PayloadFormat::Jpeg => {
            let frame = decode_jpeg(payload, width, height)?;
            Ok(Decoded {
                frame,
                adjustment: None,
            })
        }
        PayloadFormat::Mask => decode_mask(payload, width, height, options.short_frame),
    }
}

fn check_len(data: &[u8], width: u32, height: u32, bpp: usize) -> Result<()> {
    let needed = width as usize * height as usize * bpp;
    if data.len() != needed {
        return Err(DecodeError::SizeMismatch {
            expected: needed,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Bring `payload` to exactly `expected` bytes
///
/// Borrowed when no copy is needed (exact match or truncation).
///
/// # Errors
/// Returns [`DecodeError::SizeMismatch`] for a short payload under
/// [`ShortFramePolicy::Reject`].
pub fn reconcile_size(
    payload: &[u8],
    expected: usize,
    policy: ShortFramePolicy,
) -> Result<(Cow<'_, [u8]>, Option<SizeAdjustment>)> {
    use std::cmp::Ordering as SizeOrdering;

    match payload.len().cmp(&expected) {
        SizeOrdering::Equal => Ok((Cow::Borrowed(payload), None)),
        SizeOrdering::Greater => {
            let dropped = payload.len() - expected;
            // Log when the overrun changes, not on every frame
            static LAST_DROPPED: AtomicU64 = AtomicU64::new(0);
            if LAST_DROPPED.swap(dropped as u64, Ordering::Relaxed) != dropped as u64 {
                log::warn!(
                    "Payload {} bytes longer than expected {}, truncating",
                    dropped,
                    expected
                );
            }
            Ok((
                Cow::Borrowed(&payload[..expected]),
                Some(SizeAdjustment::Truncated { dropped }),
            ))
        }
        SizeOrdering::Less => match policy {
            ShortFramePolicy::Reject => Err(DecodeError::SizeMismatch {
                expected,
                actual: payload.len(),
            }),
            ShortFramePolicy::Pad => {
                let added = expected - payload.len();
                log::debug!("Padding short payload with {} zero bytes", added);
                let mut padded = Vec::with_capacity(expected);
                padded.extend_from_slice(payload);
                padded.resize(expected, 0);
                Ok((Cow::Owned(padded), Some(SizeAdjustment::Padded { added })))
            }
        },
    }
}

/// Expand one RGB565 cell to RGB888 by replicating the high bits
///
/// `0xFFFF` maps to white and `0x0000` to black; a lone top red bit (`0x8000`)
/// gives 132, the replicated `10000` pattern.
#[inline]
pub fn expand_rgb565(cell: u16) -> [u8; 3] {
    let r5 = ((cell >> 11) & 0x1F) as u8;
    let g6 = ((cell >> 5) & 0x3F) as u8;
    let b5 = (cell & 0x1F) as u8;
    [
        (r5 << 3) | (r5 >> 2),
        (g6 << 2) | (g6 >> 4),
        (b5 << 3) | (b5 >> 2),
    ]
}

/// Convert a packed RGB565 buffer to RGB888
///
/// # Errors
/// Returns [`DecodeError::MalformedPayload`] if `data` has an odd length.
pub fn rgb565_to_rgb888(data: &[u8], order: ByteOrder) -> Result<Vec<u8>> {
    if data.len() % 2 != 0 {
        return Err(DecodeError::MalformedPayload(format!(
            "odd RGB565 payload length {}",
            data.len()
        )));
    }

    // Log once
    static LOGGED: AtomicBool = AtomicBool::new(false);
    if !LOGGED.swap(true, Ordering::Relaxed) {
        log::info!(
            "RGB565 -> RGB888 conversion: {} cells, {:?}",
            data.len() / 2,
            order
        );
    }

    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for pair in data.chunks_exact(2) {
        rgb.extend_from_slice(&expand_rgb565(order.cell(pair)));
    }
    Ok(rgb)
}

/// Swap R and B channels for sinks that expect B-G-R order
pub fn to_bgr888(rgb: &[u8]) -> Vec<u8> {
    let mut bgr = Vec::with_capacity(rgb.len());
    for px in rgb.chunks_exact(3) {
        bgr.push(px[2]);
        bgr.push(px[1]);
        bgr.push(px[0]);
    }
    bgr
}

/// Whether a mask line is a complete valid row
#[inline]
pub fn is_valid_mask_row(line: &[u8], width: u32) -> bool {
    line.len() == width as usize && line.iter().all(|&c| c == b'0' || c == b'1')
}

/// Strip surrounding ASCII whitespace (CRLF endings, padding spaces)
#[inline]
pub fn trim_line(line: &[u8]) -> &[u8] {
    line.trim_ascii()
}

/// Decode newline-separated mask text into a [`PixelFormat::BinaryMask`] frame
///
/// Invalid rows are dropped silently. Extra valid rows are truncated; missing
/// rows follow `policy`.
///
/// # Errors
/// Returns [`DecodeError::SizeMismatch`] when too few valid rows remain under
/// [`ShortFramePolicy::Reject`].
pub fn decode_mask(
    payload: &[u8],
    width: u32,
    height: u32,
    policy: ShortFramePolicy,
) -> Result<Decoded> {
    let row_len = width as usize;
    let rows = height as usize;
    let mut data = Vec::with_capacity(row_len * rows);
    let mut valid = 0usize;
    let mut dropped = 0usize;

    for line in payload.split(|&b| b == b'\n').map(trim_line) {
        if line.is_empty() {
            continue;
        }
        if !is_valid_mask_row(line, width) {
            dropped += 1;
            continue;
        }
        valid += 1;
        if valid <= rows {
            data.extend(line.iter().map(|&c| c - b'0'));
        }
    }

    if dropped > 0 {
        log::debug!("Dropped {} invalid mask rows", dropped);
    }

    let adjustment = if valid > rows {
        let extra = valid - rows;
        log::warn!("Mask has {} valid rows, expected {}, truncating", valid, rows);
        Some(SizeAdjustment::Truncated {
            dropped: extra * row_len,
        })
    } else if valid < rows {
        match policy {
            ShortFramePolicy::Reject => {
                return Err(DecodeError::SizeMismatch {
                    expected: rows * row_len,
                    actual: valid * row_len,
                })
            }
            ShortFramePolicy::Pad => {
                let added = (rows - valid) * row_len;
                data.resize(rows * row_len, 0);
                Some(SizeAdjustment::Padded { added })
            }
        }
    } else {
        None
    };

    let frame = PixelFrame::new(width, height, PixelFormat::BinaryMask, data)?;
    Ok(Decoded { frame, adjustment })
}

/// Decode a complete JPEG image, requiring the configured dimensions
///
/// # Errors
/// - [`DecodeError::MalformedPayload`] if the decoder fails or the pixel
///   format is unsupported
/// - [`DecodeError::SizeMismatch`] if the image dimensions differ
pub fn decode_jpeg(payload: &[u8], width: u32, height: u32) -> Result<PixelFrame> {
    let mut decoder = jpeg_decoder::Decoder::new(payload);
    let pixels = decoder
        .decode()
        .map_err(|e| DecodeError::MalformedPayload(format!("JPEG decode error: {}", e)))?;
    let info = decoder
        .info()
        .ok_or_else(|| DecodeError::MalformedPayload("JPEG has no frame header".to_string()))?;

    if u32::from(info.width) != width || u32::from(info.height) != height {
        log::warn!(
            "JPEG is {}x{}, expected {}x{}",
            info.width,
            info.height,
            width,
            height
        );
        return Err(DecodeError::SizeMismatch {
            expected: width as usize * height as usize,
            actual: info.width as usize * info.height as usize,
        });
    }

    let rgb = match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => pixels,
        jpeg_decoder::PixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        // 16-bit luma, big-endian; keep the high byte
        jpeg_decoder::PixelFormat::L16 => pixels
            .chunks_exact(2)
            .flat_map(|p| [p[0], p[0], p[0]])
            .collect(),
        other => {
            return Err(DecodeError::MalformedPayload(format!(
                "unsupported JPEG pixel format {:?}",
                other
            )))
        }
    };

    PixelFrame::new(width, height, PixelFormat::Rgb888, rgb)
}
