//! Raw serial stream capture for debugging and replay.
//!
//! Records every chunk the byte source hands out, with its arrival time, so a
//! session can be replayed later through the exact same synchronizer and codec
//! without the device attached.
//!
//! # File Format
//!
//! - `capture_<ts>.bin`: sequence of `[u64 LE: timestamp_us][u32 LE: length][bytes]`
//! - `capture_<ts>.json`: [`CaptureMetadata`]
//!
//! # Example
//!
//! ```ignore
//! let capture = Arc::new(CaptureState::new());
//! capture.start_capture(CaptureMetadata::from_config(&config))?;
//!
//! let source = CapturingSource::new(device, Arc::clone(&capture));
//! // ... run the pipeline ...
//!
//! let result = capture.stop_capture(Path::new("captures"))?;
//! ```

use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;

use crate::config::StreamConfig;
use crate::pixel_codec::{ByteOrder, PayloadFormat};
use crate::source::{ByteSource, Chunk};

/// Errors that can occur during capture operations.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Capture is not currently active when trying to stop.
    #[error("capture is not active")]
    NotActive,

    /// Capture is already active when trying to start.
    #[error("capture is already active")]
    AlreadyActive,

    /// Failed to acquire lock on internal state.
    #[error("failed to acquire lock: {0}")]
    LockError(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory does not exist.
    #[error("output directory does not exist: {0}")]
    DirectoryNotFound(String),
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Link settings and totals for a capture session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureMetadata {
    /// Serial device the bytes came from.
    pub port: String,
    /// Baud rate the device was configured for.
    pub baud: u32,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Payload encoding.
    pub format: PayloadFormat,
    /// RGB565 cell byte order.
    pub byte_order: ByteOrder,
    /// START marker as hex.
    pub start_marker: String,
    /// END marker as hex.
    pub end_marker: String,
    /// Total number of chunks captured.
    pub total_chunks: u64,
    /// Frames decoded while capturing.
    pub total_frames: u64,
    /// Capture duration in milliseconds.
    pub duration_ms: u64,
    /// Total bytes captured.
    pub total_bytes: u64,
    /// Optional notes about the capture.
    pub description: String,
}

impl CaptureMetadata {
    /// Metadata describing the link in `config`, totals zeroed.
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            port: config.port.clone(),
            baud: config.baud,
            width: config.width,
            height: config.height,
            format: config.format,
            byte_order: config.byte_order,
            start_marker: config.start_marker.to_hex(),
            end_marker: config.end_marker.to_hex(),
            ..Default::default()
        }
    }
}

/// Result returned when capture stops successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Path to the saved chunk file.
    pub capture_path: PathBuf,
    /// Path to the saved metadata file.
    pub metadata_path: PathBuf,
    /// Summary of the capture session.
    pub metadata: CaptureMetadata,
}

/// A chunk with its arrival time relative to capture start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedChunk {
    /// Microseconds since capture start.
    pub timestamp_us: u64,
    /// Raw bytes.
    pub data: Vec<u8>,
}

/// Thread-safe state for recording serial chunks.
pub struct CaptureState {
    /// Whether capture is currently active.
    is_capturing: AtomicBool,
    /// Captured chunks in arrival order.
    chunks: Mutex<Vec<CapturedChunk>>,
    /// When the capture started.
    start_time: Mutex<Option<Instant>>,
    /// Metadata about the capture session.
    metadata: Mutex<CaptureMetadata>,
    /// Lock-free chunk counter.
    chunk_count: AtomicU64,
    /// Lock-free byte counter.
    byte_count: AtomicU64,
    /// Lock-free frame counter.
    frame_count: AtomicU64,
}

impl CaptureState {
    /// Creates a new capture state with no active capture.
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_capturing: AtomicBool::new(false),
            chunks: Mutex::new(Vec::new()),
            start_time: Mutex::new(None),
            metadata: Mutex::new(CaptureMetadata::default()),
            chunk_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
            frame_count: AtomicU64::new(0),
        }
    }

    /// Returns whether capture is currently active.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::Acquire)
    }

    /// Returns the current chunk count.
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count.load(Ordering::Relaxed)
    }

    /// Returns the current byte count.
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }

    /// Starts a new capture session.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::AlreadyActive` if a capture is already in progress.
    /// Returns `CaptureError::LockError` if the internal mutex cannot be acquired.
    pub fn start_capture(&self, metadata: CaptureMetadata) -> Result<()> {
        if self
            .is_capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::AlreadyActive);
        }

        self.chunks
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .clear();

        self.chunk_count.store(0, Ordering::Release);
        self.byte_count.store(0, Ordering::Release);
        self.frame_count.store(0, Ordering::Release);

        *self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = Some(Instant::now());

        *self
            .metadata
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = metadata;

        log::info!("Serial capture started");
        Ok(())
    }

    /// Records a chunk. Ignored when no capture is active.
    pub fn record_chunk(&self, chunk: &[u8]) {
        if !self.is_capturing.load(Ordering::Acquire) || chunk.is_empty() {
            return;
        }

        let timestamp_us = self
            .start_time
            .lock()
            .ok()
            .and_then(|t| *t)
            .map(|t| t.elapsed().as_micros() as u64)
            .unwrap_or(0);

        self.chunk_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);

        if let Ok(mut chunks) = self.chunks.lock() {
            chunks.push(CapturedChunk {
                timestamp_us,
                data: chunk.to_vec(),
            });
        } else {
            log::warn!("Failed to acquire lock for chunk recording");
        }
    }

    /// Counts a decoded frame toward the capture's metadata.
    pub fn record_frame(&self) {
        if self.is_capturing.load(Ordering::Acquire) {
            self.frame_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stops the capture and saves data to `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::NotActive` if no capture is in progress.
    /// Returns `CaptureError::DirectoryNotFound` if the output directory doesn't exist.
    /// Returns `CaptureError::Io` or `CaptureError::Json` if writing fails.
    pub fn stop_capture(&self, output_dir: &Path) -> Result<CaptureResult> {
        if self
            .is_capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::NotActive);
        }

        if !output_dir.is_dir() {
            return Err(CaptureError::DirectoryNotFound(
                output_dir.display().to_string(),
            ));
        }

        let duration_ms = self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let chunks = std::mem::take(
            &mut *self
                .chunks
                .lock()
                .map_err(|e| CaptureError::LockError(e.to_string()))?,
        );

        let metadata = {
            let mut meta = self
                .metadata
                .lock()
                .map_err(|e| CaptureError::LockError(e.to_string()))?;
            meta.duration_ms = duration_ms;
            meta.total_chunks = self.chunk_count.load(Ordering::Acquire);
            meta.total_bytes = self.byte_count.load(Ordering::Acquire);
            meta.total_frames = self.frame_count.load(Ordering::Acquire);
            meta.clone()
        };

        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let capture_path = output_dir.join(format!("capture_{}.bin", stamp));
        let metadata_path = capture_path.with_extension("json");

        write_capture_file(&capture_path, &chunks)?;
        write_metadata(&metadata_path, &metadata)?;

        log::info!(
            "Capture stopped: {} chunks, {} bytes, {} frames, {} ms -> {}",
            metadata.total_chunks,
            metadata.total_bytes,
            metadata.total_frames,
            duration_ms,
            capture_path.display()
        );

        Ok(CaptureResult {
            capture_path,
            metadata_path,
            metadata,
        })
    }

    /// Cancels the current capture without saving.
    pub fn cancel_capture(&self) {
        self.is_capturing.store(false, Ordering::Release);
        if let Ok(mut chunks) = self.chunks.lock() {
            chunks.clear();
        }
        log::info!("Capture cancelled");
    }
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte source wrapper that records every data chunk it passes through.
pub struct CapturingSource<S: ByteSource> {
    inner: S,
    capture: Arc<CaptureState>,
}

impl<S: ByteSource> CapturingSource<S> {
    /// Wrap `inner`, recording into `capture`.
    pub fn new(inner: S, capture: Arc<CaptureState>) -> Self {
        Self { inner, capture }
    }

    /// Shared capture state.
    pub fn capture(&self) -> &Arc<CaptureState> {
        &self.capture
    }
}

impl<S: ByteSource> ByteSource for CapturingSource<S> {
    fn read(&mut self, max_bytes: usize) -> crate::source::Result<Chunk> {
        let chunk = self.inner.read(max_bytes)?;
        if let Chunk::Data(data) = &chunk {
            self.capture.record_chunk(data);
        }
        Ok(chunk)
    }

    fn close(&mut self) -> crate::source::Result<()> {
        self.inner.close()
    }
}

/// Writes chunks in the capture format.
///
/// Format: `[u64 LE: timestamp_us][u32 LE: length][bytes]...`
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be written.
pub fn write_capture_file(path: &Path, chunks: &[CapturedChunk]) -> Result<()> {
    let mut file = BufWriter::new(std::fs::File::create(path)?);
    for chunk in chunks {
        file.write_all(&chunk.timestamp_us.to_le_bytes())?;
        file.write_all(&(chunk.data.len() as u32).to_le_bytes())?;
        file.write_all(&chunk.data)?;
    }
    file.flush()?;
    log::debug!("Saved {} chunks to {}", chunks.len(), path.display());
    Ok(())
}

/// Writes capture metadata as pretty JSON.
///
/// # Errors
///
/// Returns `CaptureError::Json` or `CaptureError::Io` on failure.
pub fn write_metadata(path: &Path, metadata: &CaptureMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(path, json)?;
    log::debug!("Saved metadata to {}", path.display());
    Ok(())
}

/// Reads capture metadata from a JSON file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read.
/// Returns `CaptureError::Json` if the JSON is invalid.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let json = std::fs::read_to_string(path)?;
    let metadata: CaptureMetadata = serde_json::from_str(&json)?;
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use std::thread;

    #[test]
    fn test_capture_state_new() {
        let state = CaptureState::new();
        assert!(!state.is_capturing());
        assert_eq!(state.chunk_count(), 0);
        assert_eq!(state.byte_count(), 0);
    }

    #[test]
    fn test_start_capture_already_active() {
        let state = CaptureState::new();
        state.start_capture(CaptureMetadata::default()).unwrap();
        let result = state.start_capture(CaptureMetadata::default());
        assert!(matches!(result, Err(CaptureError::AlreadyActive)));
    }

    #[test]
    fn test_record_chunk_when_not_capturing() {
        let state = CaptureState::new();
        state.record_chunk(&[0xAA, 0x55]);
        assert_eq!(state.chunk_count(), 0);
    }

    #[test]
    fn test_cancel_then_restart() {
        let state = CaptureState::new();
        state.start_capture(CaptureMetadata::default()).unwrap();
        state.record_chunk(&[1, 2]);
        state.cancel_capture();
        assert!(!state.is_capturing());
        state.start_capture(CaptureMetadata::default()).unwrap();
        assert_eq!(state.chunk_count(), 0);
    }

    #[test]
    fn test_stop_capture_not_active() {
        let dir = tempfile::tempdir().unwrap();
        let state = CaptureState::new();
        assert!(matches!(
            state.stop_capture(dir.path()),
            Err(CaptureError::NotActive)
        ));
    }

    #[test]
    fn test_stop_capture_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let state = CaptureState::new();
        state.start_capture(CaptureMetadata::default()).unwrap();
        assert!(matches!(
            state.stop_capture(&dir.path().join("absent")),
            Err(CaptureError::DirectoryNotFound(_))
        ));
    }

    #[test]
    fn test_concurrent_chunk_recording() {
        let state = Arc::new(CaptureState::new());
        state.start_capture(CaptureMetadata::default()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for _ in 0..50 {
                        state.record_chunk(&[i as u8; 16]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(state.chunk_count(), 400);
        assert_eq!(state.byte_count(), 6400);
    }

    #[test]
    fn test_full_capture_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(CaptureState::new());
        let config = StreamConfig::default();
        state
            .start_capture(CaptureMetadata::from_config(&config))
            .unwrap();

        let mut source = CapturingSource::new(
            MemorySource::from_bytes(&[0xAB; 100], 30),
            Arc::clone(&state),
        );
        while let Chunk::Data(_) = source.read(64).unwrap() {}
        state.record_frame();

        let result = state.stop_capture(dir.path()).unwrap();
        assert_eq!(result.metadata.total_chunks, 4);
        assert_eq!(result.metadata.total_bytes, 100);
        assert_eq!(result.metadata.total_frames, 1);
        assert_eq!(result.metadata.start_marker, "AA55AA55");
        assert_eq!(result.metadata_path, result.capture_path.with_extension("json"));

        // 4 records of 12-byte header plus 100 payload bytes
        let raw = std::fs::read(&result.capture_path).unwrap();
        assert_eq!(raw.len(), 4 * 12 + 100);
        assert_eq!(u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]), 30);

        let meta = read_metadata(&result.metadata_path).unwrap();
        assert_eq!(meta, result.metadata);
    }

    #[test]
    fn test_metadata_tolerates_missing_fields() {
        let meta: CaptureMetadata = serde_json::from_str(r#"{"width": 80}"#).unwrap();
        assert_eq!(meta.width, 80);
        assert_eq!(meta.format, PayloadFormat::Rgb565);
        assert_eq!(meta.total_chunks, 0);
    }
}
