//! Capture replay for testing without the device attached.
//!
//! Plays a recorded serial session back as a [`ByteSource`], so the exact
//! bytes (and read boundaries) the device produced run through the same
//! synchronizer and codec again.
//!
//! # File Format
//!
//! Reads the format written by [`crate::capture::write_capture_file`]:
//! ```text
//! [u64 LE: timestamp_us][u32 LE: length][bytes]...
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use serial_cam_lib::replay::CaptureReplay;
//!
//! let replay = CaptureReplay::load(Path::new("capture_12345.bin"))?;
//! let mut config = StreamConfig::default();
//! replay.apply_metadata(&mut config);
//!
//! let source = replay.into_source(config.read_timeout());
//! let mut pipeline = Pipeline::new(source, sink, &config);
//! pipeline.run()?;
//! ```

use std::io::Read;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::capture::{read_metadata, CapturedChunk, CaptureMetadata};
use crate::config::StreamConfig;
use crate::frame_sync::{FrameSynchronizer, RawFrame, SyncConfig, SyncResult};
use crate::marker_scan::Marker;
use crate::pipeline::{Pipeline, PipelineError};
use crate::pixel_codec::PixelFrame;
use crate::sink::CollectingSink;
use crate::source::{self, ByteSource, Chunk};

/// Largest chunk a capture file may declare.
const MAX_CHUNK_LEN: usize = 1024 * 1024;

/// Errors that can occur during replay operations.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// File not found or cannot be opened.
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    /// Invalid or corrupted chunk data in the capture file.
    #[error("invalid chunk data at offset {offset}: {message}")]
    InvalidChunk {
        /// Byte offset in the capture file where the error occurred.
        offset: u64,
        /// Description of the error.
        message: String,
    },

    /// Metadata file is invalid.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Replaying through the pipeline failed.
    #[error("replay pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Configuration for capture replay.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Playback speed multiplier (1.0 = realtime, 2.0 = 2x speed, 0.0 = as fast as possible).
    pub speed: f64,
    /// Whether to loop the replay when reaching the end.
    pub loop_playback: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            loop_playback: false,
        }
    }
}

impl ReplayConfig {
    /// Replay settings from the stream configuration.
    pub fn from_stream(config: &StreamConfig) -> Self {
        Self {
            speed: config.replay_speed,
            loop_playback: config.replay_loop,
        }
    }

    /// Fastest possible single pass.
    pub fn unthrottled() -> Self {
        Self {
            speed: 0.0,
            loop_playback: false,
        }
    }
}

/// A loaded capture file.
#[derive(Debug, Clone)]
pub struct CaptureReplay {
    /// Recorded chunks in arrival order.
    chunks: Vec<CapturedChunk>,
    /// Metadata from the companion JSON file, if any.
    metadata: Option<CaptureMetadata>,
    /// Replay configuration.
    config: ReplayConfig,
}

impl CaptureReplay {
    /// Load captured chunks from a binary file.
    ///
    /// A companion `.json` metadata file next to it is loaded when present.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::FileOpen` if the file cannot be opened.
    /// Returns `ReplayError::InvalidChunk` if the file contains corrupted data.
    pub fn load(path: &Path) -> Result<Self> {
        let chunks = read_capture_chunks(path)?;
        let metadata = try_load_metadata(path);

        log::info!("Loaded {} chunks from {}", chunks.len(), path.display());
        if let Some(ref meta) = metadata {
            log::info!(
                "Metadata: {}x{} {:?} {:?} from {}, {} frames, {} ms",
                meta.width,
                meta.height,
                meta.format,
                meta.byte_order,
                meta.port,
                meta.total_frames,
                meta.duration_ms
            );
        }

        Ok(Self {
            chunks,
            metadata,
            config: ReplayConfig::default(),
        })
    }

    /// Load chunks with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or contains invalid chunk data.
    pub fn load_with_config(path: &Path, config: ReplayConfig) -> Result<Self> {
        let mut replay = Self::load(path)?;
        replay.config = config;
        Ok(replay)
    }

    /// Build a replay from chunks already in memory.
    pub fn from_chunks(chunks: Vec<CapturedChunk>, metadata: Option<CaptureMetadata>) -> Self {
        Self {
            chunks,
            metadata,
            config: ReplayConfig::default(),
        }
    }

    /// Get the loaded metadata, if available.
    #[must_use]
    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    /// Get the recorded chunks.
    #[must_use]
    pub fn chunks(&self) -> &[CapturedChunk] {
        &self.chunks
    }

    /// Get the number of loaded chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total recorded bytes.
    #[must_use]
    pub fn byte_count(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }

    /// Get the total duration of the capture in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.chunks
            .last()
            .map(|c| c.timestamp_us / 1000)
            .unwrap_or(0)
    }

    /// Set the replay configuration.
    pub fn set_config(&mut self, config: ReplayConfig) {
        self.config = config;
    }

    /// Overwrite the link settings in `config` with the recorded ones.
    ///
    /// Only metadata that actually describes a link (non-zero geometry) is
    /// applied; markers are applied when they parse.
    pub fn apply_metadata(&self, config: &mut StreamConfig) {
        let Some(meta) = &self.metadata else {
            return;
        };
        if meta.width == 0 || meta.height == 0 {
            log::debug!("Capture metadata has no geometry, keeping configured link settings");
            return;
        }

        config.width = meta.width;
        config.height = meta.height;
        config.format = meta.format;
        config.byte_order = meta.byte_order;
        config.bytes_per_pixel = None;
        if let Some(start) = Marker::from_hex(&meta.start_marker) {
            config.start_marker = start;
        }
        if let Some(end) = Marker::from_hex(&meta.end_marker) {
            config.end_marker = end;
        }
    }

    /// Turn into a byte source, waiting at most `poll` per read.
    pub fn into_source(self, poll: Duration) -> ReplaySource {
        ReplaySource::new(self.chunks, self.config, poll)
    }
}

/// Read chunks with timestamp information from a binary capture file.
///
/// Format: `[u64 LE: timestamp_us][u32 LE: length][bytes]...`
///
/// # Errors
///
/// Returns `ReplayError::FileOpen` if the file cannot be read.
/// Returns `ReplayError::InvalidChunk` on a truncated or oversized record.
pub fn read_capture_chunks(path: &Path) -> Result<Vec<CapturedChunk>> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut chunks = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut timestamp_bytes = [0u8; 8];
        match file.read_exact(&mut timestamp_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(ReplayError::FileOpen(e)),
        }
        let timestamp_us = u64::from_le_bytes(timestamp_bytes);

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)
            .map_err(|_| ReplayError::InvalidChunk {
                offset,
                message: "unexpected EOF reading chunk length".to_string(),
            })?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_CHUNK_LEN {
            return Err(ReplayError::InvalidChunk {
                offset,
                message: format!("chunk length {} exceeds 1MB limit", len),
            });
        }

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)
            .map_err(|_| ReplayError::InvalidChunk {
                offset,
                message: format!("unexpected EOF reading {} bytes of data", len),
            })?;

        chunks.push(CapturedChunk { timestamp_us, data });
        offset += 8 + 4 + len as u64;
    }

    Ok(chunks)
}

/// Try to load metadata from the companion JSON file.
///
/// Looks for a file with the same base name but `.json` extension.
fn try_load_metadata(path: &Path) -> Option<CaptureMetadata> {
    let json_path = path.with_extension("json");
    if !json_path.exists() {
        return None;
    }
    match read_metadata(&json_path) {
        Ok(meta) => Some(meta),
        Err(e) => {
            log::warn!("Ignoring unreadable metadata {}: {}", json_path.display(), e);
            None
        }
    }
}

/// Plays recorded chunks back as a [`ByteSource`].
///
/// Each recorded chunk is handed out as it was read from the device (split
/// further if the caller asks for fewer bytes). With a non-zero speed, a
/// chunk is not released before its recorded time divided by the speed;
/// waits longer than `poll` come back as [`Chunk::Timeout`] so the caller
/// can check its stop signal.
#[derive(Debug)]
pub struct ReplaySource {
    chunks: Vec<CapturedChunk>,
    config: ReplayConfig,
    poll: Duration,
    index: usize,
    offset: usize,
    started: Option<Instant>,
    passes: u64,
}

impl ReplaySource {
    /// Create a source over `chunks`.
    pub fn new(chunks: Vec<CapturedChunk>, config: ReplayConfig, poll: Duration) -> Self {
        let chunks: Vec<_> = chunks.into_iter().filter(|c| !c.data.is_empty()).collect();
        Self {
            chunks,
            config,
            poll: poll.max(Duration::from_millis(1)),
            index: 0,
            offset: 0,
            started: None,
            passes: 0,
        }
    }

    /// Load `path` and play it back with `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the capture file cannot be read.
    pub fn open(path: &Path, config: ReplayConfig, poll: Duration) -> Result<Self> {
        let mut replay = CaptureReplay::load(path)?;
        replay.set_config(config);
        Ok(replay.into_source(poll))
    }

    /// Completed passes over the capture.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// How long until the current chunk is due, if it is not yet.
    fn pending_wait(&mut self) -> Option<Duration> {
        if self.config.speed <= 0.0 || self.offset > 0 {
            return None;
        }
        let started = *self.started.get_or_insert_with(Instant::now);
        let timestamp_us = self.chunks[self.index].timestamp_us;
        let due = Duration::from_micros((timestamp_us as f64 / self.config.speed) as u64);
        due.checked_sub(started.elapsed()).filter(|d| !d.is_zero())
    }
}

impl ByteSource for ReplaySource {
    fn read(&mut self, max_bytes: usize) -> source::Result<Chunk> {
        if self.index >= self.chunks.len() {
            if self.chunks.is_empty() {
                return Ok(Chunk::EndOfStream);
            }
            if !self.config.loop_playback {
                return Ok(Chunk::EndOfStream);
            }
            log::info!("Replay looping (pass {})", self.passes + 1);
            self.index = 0;
            self.offset = 0;
            self.started = None;
        }

        if let Some(wait) = self.pending_wait() {
            if wait > self.poll {
                thread::sleep(self.poll);
                return Ok(Chunk::Timeout);
            }
            thread::sleep(wait);
        }

        let chunk = &self.chunks[self.index].data;
        let end = (self.offset + max_bytes.max(1)).min(chunk.len());
        let data = chunk[self.offset..end].to_vec();

        if end == chunk.len() {
            self.index += 1;
            self.offset = 0;
            if self.index == self.chunks.len() {
                self.passes += 1;
            }
        } else {
            self.offset = end;
        }
        Ok(Chunk::Data(data))
    }
}

/// Replay a capture as fast as possible and return every decoded frame.
///
/// Link settings in `config` are overridden by the capture's metadata when it
/// has any. Frames that fail to decode are skipped, as in live operation.
///
/// # Errors
///
/// Returns an error if the capture cannot be loaded or the pipeline fails.
pub fn replay_all_frames(path: &Path, config: &StreamConfig) -> Result<Vec<PixelFrame>> {
    let mut replay = CaptureReplay::load(path)?;
    replay.set_config(ReplayConfig::unthrottled());

    let mut config = config.clone();
    replay.apply_metadata(&mut config);
    config
        .validate()
        .map_err(|e| ReplayError::Metadata(e.to_string()))?;

    let sink = CollectingSink::new();
    let source = replay.into_source(config.read_timeout());
    let mut pipeline = Pipeline::new(source, sink.clone(), &config);
    let stats = pipeline.run()?;

    log::info!(
        "Replayed {} bytes into {} frames",
        stats.bytes_read,
        stats.frames_delivered
    );
    Ok(sink.frames())
}

/// Iterator over the raw payloads of a capture.
///
/// Runs only the synchronizer, without decoding, which is handy for
/// inspecting what the device actually sent between the markers.
pub struct FrameIterator {
    chunks: std::vec::IntoIter<CapturedChunk>,
    sync: FrameSynchronizer,
}

impl FrameIterator {
    /// Create an iterator over the payloads in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the capture file cannot be loaded.
    pub fn new(path: &Path, sync: SyncConfig) -> Result<Self> {
        let chunks = read_capture_chunks(path)?;
        Ok(Self {
            chunks: chunks.into_iter(),
            sync: FrameSynchronizer::new(sync),
        })
    }
}

impl Iterator for FrameIterator {
    type Item = RawFrame;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.sync.try_extract_frame() {
                SyncResult::Frame(frame) => return Some(frame),
                SyncResult::Malformed(m) => log::debug!("Skipping malformed region: {:?}", m),
                SyncResult::Pending => {
                    let chunk = self.chunks.next()?;
                    self.sync.feed(&chunk.data);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{write_capture_file, write_metadata};
    use crate::pixel_codec::{ByteOrder, PayloadFormat};
    use crate::test_utils::{frame_stream, rgb565_frame, split_fixed, Rgb};
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn create_test_capture(chunks: &[CapturedChunk]) -> PathBuf {
        let dir = tempdir().unwrap().keep();
        let path = dir.join("capture_test.bin");
        write_capture_file(&path, chunks).unwrap();
        path
    }

    fn chunked(data: &[u8], size: usize, step_us: u64) -> Vec<CapturedChunk> {
        split_fixed(data, size)
            .into_iter()
            .enumerate()
            .map(|(i, data)| CapturedChunk {
                timestamp_us: i as u64 * step_us,
                data,
            })
            .collect()
    }

    #[test]
    fn test_load_capture() {
        let chunks = chunked(&[1, 2, 3, 4, 5], 2, 1500);
        let path = create_test_capture(&chunks);
        let replay = CaptureReplay::load(&path).unwrap();

        assert_eq!(replay.chunk_count(), 3);
        assert_eq!(replay.byte_count(), 5);
        assert_eq!(replay.duration_ms(), 3);
        assert_eq!(replay.chunks(), &chunks[..]);
        assert!(replay.metadata().is_none());
    }

    #[test]
    fn test_replay_config_default() {
        let config = ReplayConfig::default();
        assert!((config.speed - 1.0).abs() < f64::EPSILON);
        assert!(!config.loop_playback);
    }

    #[test]
    fn test_source_preserves_bytes_and_boundaries() {
        let chunks = chunked(&(0..20).collect::<Vec<u8>>(), 6, 10);
        let mut source =
            ReplaySource::new(chunks, ReplayConfig::unthrottled(), Duration::from_millis(10));

        let mut reads = Vec::new();
        while let Chunk::Data(data) = source.read(4).unwrap() {
            reads.push(data);
        }
        // Recorded chunks of 6 split at the 4-byte request size
        let lens: Vec<_> = reads.iter().map(Vec::len).collect();
        assert_eq!(lens, vec![4, 2, 4, 2, 4, 2, 2]);
        assert_eq!(reads.concat(), (0..20).collect::<Vec<u8>>());
        assert_eq!(source.read(4).unwrap(), Chunk::EndOfStream);
    }

    #[test]
    fn test_passes_stop_counting_after_end() {
        let chunks = chunked(&[1, 2, 3], 2, 0);
        let mut source =
            ReplaySource::new(chunks, ReplayConfig::unthrottled(), Duration::from_millis(10));

        assert_eq!(source.read(16).unwrap(), Chunk::Data(vec![1, 2]));
        assert_eq!(source.passes(), 0);
        assert_eq!(source.read(16).unwrap(), Chunk::Data(vec![3]));
        assert_eq!(source.passes(), 1);
        for _ in 0..3 {
            assert_eq!(source.read(16).unwrap(), Chunk::EndOfStream);
        }
        assert_eq!(source.passes(), 1);
    }

    #[test]
    fn test_source_loops() {
        let chunks = chunked(&[9, 8], 1, 0);
        let config = ReplayConfig {
            speed: 0.0,
            loop_playback: true,
        };
        let mut source = ReplaySource::new(chunks, config, Duration::from_millis(10));

        let mut seen = Vec::new();
        for _ in 0..5 {
            if let Chunk::Data(d) = source.read(16).unwrap() {
                seen.extend(d);
            }
        }
        assert_eq!(seen, vec![9, 8, 9, 8, 9]);
        assert_eq!(source.passes(), 2);
    }

    #[test]
    fn test_empty_source_ends_even_when_looping() {
        let config = ReplayConfig {
            speed: 0.0,
            loop_playback: true,
        };
        let mut source = ReplaySource::new(Vec::new(), config, Duration::from_millis(10));
        assert_eq!(source.read(16).unwrap(), Chunk::EndOfStream);
    }

    #[test]
    fn test_timed_replay_reports_timeouts_while_waiting() {
        let chunks = vec![
            CapturedChunk {
                timestamp_us: 0,
                data: vec![1],
            },
            CapturedChunk {
                timestamp_us: 200_000,
                data: vec![2],
            },
        ];
        let config = ReplayConfig {
            speed: 1.0,
            loop_playback: false,
        };
        let mut source = ReplaySource::new(chunks, config, Duration::from_millis(20));

        let started = Instant::now();
        assert_eq!(source.read(8).unwrap(), Chunk::Data(vec![1]));
        assert_eq!(source.read(8).unwrap(), Chunk::Timeout);

        let mut timeouts = 1;
        loop {
            match source.read(8).unwrap() {
                Chunk::Timeout => timeouts += 1,
                Chunk::Data(d) => {
                    assert_eq!(d, vec![2]);
                    break;
                }
                Chunk::EndOfStream => panic!("ended before second chunk"),
            }
        }
        assert!(timeouts >= 2);
        assert!(started.elapsed() >= Duration::from_millis(190));
    }

    #[test]
    fn test_replay_all_frames_empty() {
        let path = create_test_capture(&[]);
        let frames = replay_all_frames(&path, &StreamConfig::default()).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn test_replay_all_frames_uses_metadata() {
        let stream = frame_stream(&[
            rgb565_frame(4, 2, Rgb::GREEN),
            rgb565_frame(4, 2, Rgb::BLUE),
        ]);
        let path = create_test_capture(&chunked(&stream, 5, 100));

        let metadata = CaptureMetadata {
            width: 4,
            height: 2,
            format: PayloadFormat::Rgb565,
            byte_order: ByteOrder::BigEndian,
            start_marker: "AA55AA55".to_string(),
            end_marker: "55AA55AA".to_string(),
            ..Default::default()
        };
        write_metadata(&path.with_extension("json"), &metadata).unwrap();

        // Default config says 160x120; the metadata wins
        let frames = replay_all_frames(&path, &StreamConfig::default()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!((frames[0].width, frames[0].height), (4, 2));
        assert_eq!(frames[0].pixel(0, 0), Some(&[0, 255, 0][..]));
        assert_eq!(frames[1].pixel(3, 1), Some(&[0, 0, 255][..]));
    }

    #[test]
    fn test_frame_iterator() {
        let stream = frame_stream(&[vec![1, 2, 3], vec![4, 5]]);
        let path = create_test_capture(&chunked(&stream, 3, 0));

        let frames: Vec<_> = FrameIterator::new(&path, SyncConfig::reference())
            .unwrap()
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, vec![1, 2, 3]);
        assert_eq!(frames[1].payload, vec![4, 5]);
        assert_eq!(frames[1].sequence, 1);
    }

    #[test]
    fn test_corrupt_metadata_is_ignored() {
        let path = create_test_capture(&chunked(&[1], 1, 0));
        std::fs::write(path.with_extension("json"), "{not json").unwrap();

        let replay = CaptureReplay::load(&path).unwrap();
        assert!(replay.metadata().is_none());
    }

    #[test]
    fn test_invalid_chunk_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad_capture.bin");

        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&0u64.to_le_bytes()).unwrap();
        file.write_all(&(2 * 1024 * 1024u32).to_le_bytes()).unwrap();
        drop(file);

        let result = CaptureReplay::load(&path);
        assert!(matches!(
            result,
            Err(ReplayError::InvalidChunk { message, .. }) if message.contains("exceeds")
        ));
    }

    #[test]
    fn test_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("truncated.bin");

        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&0u64.to_le_bytes()).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[0xAA]).unwrap();
        drop(file);

        let result = CaptureReplay::load(&path);
        assert!(matches!(result, Err(ReplayError::InvalidChunk { offset: 0, .. })));
    }
}
