//! Stream configuration
//!
//! Everything the pipeline needs to know about the link: transport, framing,
//! geometry, payload encoding and output. Loaded from JSON (all fields
//! optional) and then overridden by `SERIALCAM_*` environment variables.
//!
//! ```json
//! {
//!   "port": "/dev/ttyACM0",
//!   "baud": 921600,
//!   "width": 160,
//!   "height": 120,
//!   "format": "rgb565",
//!   "byte_order": "big_endian",
//!   "short_frame_policy": "pad",
//!   "output": "png",
//!   "output_dir": "frames"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame_sync::SyncConfig;
use crate::marker_scan::Marker;
use crate::pixel_codec::{
    expected_payload_size, ByteOrder, DecodeOptions, PayloadFormat, PixelCodec, ShortFramePolicy,
};
use crate::sink::{SinkKind, SinkPolicy};

/// Transport identifier override
pub const ENV_PORT: &str = "SERIALCAM_PORT";
/// Baud rate override
pub const ENV_BAUD: &str = "SERIALCAM_BAUD";
/// Short-frame policy override (`reject` | `pad`)
pub const ENV_SHORT_FRAME: &str = "SERIALCAM_SHORT_FRAME";
/// RGB565 byte order override (`big_endian` | `little_endian`)
pub const ENV_BYTE_ORDER: &str = "SERIALCAM_BYTE_ORDER";
/// Payload format override (`rgb565` | `rgb888` | `jpeg` | `mask`)
pub const ENV_FORMAT: &str = "SERIALCAM_FORMAT";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Config file is not valid JSON for [`StreamConfig`]
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    /// Values are individually valid but cannot work together
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// How frames are delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// START/END marker sequences
    #[default]
    Markers,
    /// One mask row per line, no markers
    Lines,
}

/// Where decoded frames go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Keep only the latest frame in memory
    #[default]
    Preview,
    /// One raw packed file per frame
    Raw,
    /// One PNG per frame
    Png,
}

impl OutputKind {
    /// Preview or file-backed, for policy defaults
    pub fn sink_kind(self) -> SinkKind {
        match self {
            OutputKind::Preview => SinkKind::Preview,
            OutputKind::Raw | OutputKind::Png => SinkKind::File,
        }
    }

    /// Whether frames outlive the run (written to disk)
    pub fn keeps_frames(self) -> bool {
        self.sink_kind() == SinkKind::File
    }
}

/// Full link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Serial device path (e.g. `/dev/ttyACM0`)
    pub port: String,
    /// Baud rate; recorded in capture metadata, the port itself is set up externally
    pub baud: u32,
    /// Longest a single read may block
    pub read_timeout_ms: u64,
    /// Bytes requested per read
    pub read_chunk: usize,
    /// Marker or line framing
    pub framing: Framing,
    /// Frame start marker
    pub start_marker: Marker,
    /// Frame end marker
    pub end_marker: Marker,
    /// Keep markers in the payload (JPEG)
    pub include_markers: bool,
    /// Abandon a frame after this many payload bytes without END
    ///
    /// 0 derives the limit from the geometry; see
    /// [`StreamConfig::effective_max_payload_len`].
    pub max_payload_len: usize,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Wire bytes per pixel; derived from `format` when absent
    pub bytes_per_pixel: Option<usize>,
    /// Payload encoding
    pub format: PayloadFormat,
    /// RGB565 cell byte order
    pub byte_order: ByteOrder,
    /// Short payload handling; defaults by output kind when absent
    pub short_frame_policy: Option<ShortFramePolicy>,
    /// Frame destination
    pub output: OutputKind,
    /// Directory for file outputs
    pub output_dir: PathBuf,
    /// Nearest-neighbour upscale for PNG output
    pub png_scale: u32,
    /// Write PNG channels in B-G-R order
    pub bgr_output: bool,
    /// Slow-sink handling
    pub sink_policy: SinkPolicy,
    /// Record raw serial bytes to this directory while running
    pub capture_dir: Option<PathBuf>,
    /// Read from a capture file instead of the device
    pub replay_file: Option<PathBuf>,
    /// Replay speed multiplier (0 = as fast as possible)
    pub replay_speed: f64,
    /// Start the capture over when it runs out
    pub replay_loop: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud: 921_600,
            read_timeout_ms: 1000,
            read_chunk: 4096,
            framing: Framing::Markers,
            start_marker: Marker::reference_start(),
            end_marker: Marker::reference_end(),
            include_markers: false,
            max_payload_len: 0,
            width: 160,
            height: 120,
            bytes_per_pixel: None,
            format: PayloadFormat::Rgb565,
            byte_order: ByteOrder::BigEndian,
            short_frame_policy: None,
            output: OutputKind::Preview,
            output_dir: PathBuf::from("frames"),
            png_scale: 1,
            bgr_output: false,
            sink_policy: SinkPolicy::Block,
            capture_dir: None,
            replay_file: None,
            replay_speed: 1.0,
            replay_loop: false,
        }
    }
}

impl StreamConfig {
    /// Parse from a JSON string, missing fields taking defaults
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] on malformed JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file
    ///
    /// # Errors
    /// Returns [`ConfigError::Io`] if unreadable, [`ConfigError::Parse`] if malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&json)?;
        log::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Apply `SERIALCAM_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (testable without touching the environment)
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup(ENV_PORT) {
            log::info!("{} override: {}", ENV_PORT, port);
            self.port = port;
        }
        if let Some(baud) = lookup(ENV_BAUD) {
            match baud.trim().parse::<u32>() {
                Ok(b) if b > 0 => self.baud = b,
                _ => log::warn!("Ignoring invalid {} '{}', keeping {}", ENV_BAUD, baud, self.baud),
            }
        }
        if let Some(policy) = lookup(ENV_SHORT_FRAME) {
            if let Some(p) = ShortFramePolicy::from_env_str(&policy) {
                self.short_frame_policy = Some(p);
            }
        }
        if let Some(order) = lookup(ENV_BYTE_ORDER) {
            self.byte_order = ByteOrder::from_env_str(&order);
        }
        if let Some(format) = lookup(ENV_FORMAT) {
            self.format = PayloadFormat::from_env_str(&format);
        }
    }

    /// Check that the options can work together
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame geometry {}x{} has no pixels",
                self.width, self.height
            )));
        }
        if let (Some(bpp), Some(wire)) = (self.bytes_per_pixel, self.format.wire_bytes_per_pixel())
        {
            if bpp != wire {
                return Err(ConfigError::Invalid(format!(
                    "bytes_per_pixel {} does not match {:?} ({} bytes per pixel)",
                    bpp, self.format, wire
                )));
            }
        }
        if self.framing == Framing::Lines && self.format != PayloadFormat::Mask {
            return Err(ConfigError::Invalid(
                "line framing is only supported for the mask format".to_string(),
            ));
        }
        if self.framing == Framing::Markers && self.start_marker == self.end_marker {
            return Err(ConfigError::Invalid(
                "start and end markers must differ".to_string(),
            ));
        }
        if self.read_chunk == 0 {
            return Err(ConfigError::Invalid("read_chunk must be positive".to_string()));
        }
        if self.png_scale == 0 {
            return Err(ConfigError::Invalid("png_scale must be positive".to_string()));
        }
        if self.replay_speed < 0.0 || !self.replay_speed.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "replay_speed {} must be a finite non-negative number",
                self.replay_speed
            )));
        }
        let expected = self.expected_payload_size();
        if self.max_payload_len != 0 && self.max_payload_len < expected {
            return Err(ConfigError::Invalid(format!(
                "max_payload_len {} is below the expected payload size {}",
                self.max_payload_len, expected
            )));
        }
        Ok(())
    }

    /// Short-frame policy in effect, falling back to the output kind's default
    pub fn effective_short_frame_policy(&self) -> ShortFramePolicy {
        self.short_frame_policy
            .unwrap_or_else(|| ShortFramePolicy::default_for(self.output.sink_kind()))
    }

    /// Expected payload size for the configured geometry
    pub fn expected_payload_size(&self) -> usize {
        expected_payload_size(self.width, self.height, self.format)
    }

    /// Payload limit handed to the synchronizer
    ///
    /// An explicit `max_payload_len` wins. Otherwise it is twice the largest
    /// payload the geometry allows plus both markers, so a lost END never lets
    /// the buffer grow past a couple of frames. Masks are sized for CRLF rows
    /// and JPEG for an uncompressed RGB888 image.
    pub fn effective_max_payload_len(&self) -> usize {
        if self.max_payload_len != 0 {
            return self.max_payload_len;
        }
        let rows = self.height as usize;
        let largest = match self.format {
            PayloadFormat::Mask => (self.width as usize + 2) * rows,
            PayloadFormat::Jpeg => self.width as usize * rows * 3,
            _ => self.expected_payload_size(),
        };
        2 * largest + self.start_marker.len() + self.end_marker.len()
    }

    /// Read timeout as a [`Duration`]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Synchronizer settings
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            start: self.start_marker.clone(),
            end: self.end_marker.clone(),
            include_markers: self.include_markers,
            max_payload_len: self.effective_max_payload_len(),
        }
    }

    /// Codec options
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            byte_order: self.byte_order,
            short_frame: self.effective_short_frame_policy(),
        }
    }

    /// Codec for the configured geometry and format
    pub fn codec(&self) -> PixelCodec {
        PixelCodec::new(self.width, self.height, self.format, self.decode_options())
    }
}
