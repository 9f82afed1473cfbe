//! Read → synchronize → decode → deliver loop
//!
//! One thread owns the source, the synchronizer and the codec. Each iteration
//! checks the stop signal, performs one bounded read and pushes every frame
//! that read completed through the codec into the sink. Decode problems are
//! counted and skipped; only the source or the sink can end the loop early.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

use crate::capture::CaptureState;
use crate::config::{Framing, StreamConfig};
use crate::frame_sync::{FrameSynchronizer, Malformed, RawFrame, SyncResult, SyncStats};
use crate::mask_assembler::{MaskAssembler, MaskStats};
use crate::pixel_codec::{DecodeError, PixelCodec, PixelFrame, SizeAdjustment};
use crate::sink::{FrameSink, SinkError};
use crate::source::{ByteSource, Chunk, SourceError};

/// Fatal pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Byte source failed permanently
    #[error("source failed: {0}")]
    Source(#[from] SourceError),
    /// Sink failed
    #[error("sink failed: {0}")]
    Sink(#[from] SinkError),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Cooperative stop flag, checked once per loop iteration before reading
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Create a signal in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop after the current iteration
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Still running
    #[default]
    Running,
    /// Stop signal raised
    Stopped,
    /// Source reported end of stream
    EndOfStream,
}

/// Counters for one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    /// Non-empty reads
    pub chunks: u64,
    /// Bytes read
    pub bytes_read: u64,
    /// Reads that timed out
    pub timeouts: u64,
    /// Payloads located by the synchronizer
    pub frames_synced: u64,
    /// Frames delivered to the sink
    pub frames_delivered: u64,
    /// Payloads truncated to the expected size
    pub truncated: u64,
    /// Payloads zero-padded to the expected size
    pub padded: u64,
    /// Payloads rejected for size
    pub size_mismatch: u64,
    /// Payloads rejected as structurally invalid
    pub malformed_payload: u64,
    /// Stray END markers
    pub malformed_ordering: u64,
    /// Frames abandoned for exceeding the payload limit
    pub oversized: u64,
    /// Synchronizer counters (marker framing)
    pub sync: Option<SyncStats>,
    /// Mask row counters (line framing)
    pub mask: Option<MaskStats>,
    /// Wall time of the run
    pub elapsed_ms: u64,
    /// Why the loop ended
    pub stop_reason: StopReason,
}

enum Framer {
    Markers {
        sync: FrameSynchronizer,
        codec: PixelCodec,
    },
    Lines(MaskAssembler),
}

/// The frame loop
pub struct Pipeline<S: ByteSource, K: FrameSink> {
    source: S,
    sink: K,
    framer: Framer,
    read_chunk: usize,
    stop: StopSignal,
    capture: Option<Arc<CaptureState>>,
    stats: PipelineStats,
    description: String,
}

impl<S: ByteSource, K: FrameSink> Pipeline<S, K> {
    /// Build a pipeline for `config`
    pub fn new(source: S, sink: K, config: &StreamConfig) -> Self {
        let framer = match config.framing {
            Framing::Markers => Framer::Markers {
                sync: FrameSynchronizer::new(config.sync_config()),
                codec: config.codec(),
            },
            Framing::Lines => Framer::Lines(MaskAssembler::new(config.width, config.height)),
        };
        let description = format!(
            "{}x{} {:?}, {:?}, short frames: {:?}, markers {}/{}{}",
            config.width,
            config.height,
            config.format,
            config.byte_order,
            config.effective_short_frame_policy(),
            config.start_marker.to_hex(),
            config.end_marker.to_hex(),
            if config.framing == Framing::Lines {
                " (unused, line framing)"
            } else {
                ""
            }
        );
        Self {
            source,
            sink,
            framer,
            read_chunk: config.read_chunk.max(1),
            stop: StopSignal::new(),
            capture: None,
            stats: PipelineStats::default(),
            description,
        }
    }

    /// Use an externally owned stop signal
    #[must_use]
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Count delivered frames into an active capture
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<CaptureState>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Handle for stopping the loop from another thread
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Counters so far
    pub fn stats(&self) -> PipelineStats {
        let mut stats = self.stats.clone();
        match &self.framer {
            Framer::Markers { sync, .. } => stats.sync = Some(sync.stats()),
            Framer::Lines(asm) => stats.mask = Some(asm.stats()),
        }
        stats
    }

    /// Give back the source and sink
    pub fn into_parts(self) -> (S, K) {
        (self.source, self.sink)
    }

    /// Run until stopped or the source ends
    ///
    /// The sink is finished and the source closed on every exit path.
    ///
    /// # Errors
    /// Returns [`PipelineError`] if the source or sink fails.
    pub fn run(&mut self) -> Result<PipelineStats> {
        log::info!("Pipeline starting: {}", self.description);
        let started = Instant::now();

        let outcome = loop {
            match self.step() {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.stats.elapsed_ms = started.elapsed().as_millis() as u64;
        let finished = self.sink.finish().map_err(PipelineError::from);
        let closed = self.source.close().map_err(PipelineError::from);
        outcome.and(finished).and(closed)?;

        let stats = self.stats();
        log::info!(
            "Pipeline finished ({:?}): {} frames delivered, {} synced, {} rejected, {} ms",
            stats.stop_reason,
            stats.frames_delivered,
            stats.frames_synced,
            stats.size_mismatch + stats.malformed_payload,
            stats.elapsed_ms
        );
        Ok(stats)
    }

    /// One iteration: check the stop signal, read once, process what arrived
    ///
    /// Returns `false` once the loop should end.
    ///
    /// # Errors
    /// Returns [`PipelineError`] if the source or sink fails.
    pub fn step(&mut self) -> Result<bool> {
        if self.stop.is_stopped() {
            log::info!("Stop requested");
            self.stats.stop_reason = StopReason::Stopped;
            return Ok(false);
        }

        match self.source.read(self.read_chunk)? {
            Chunk::Data(data) => {
                self.stats.chunks += 1;
                self.stats.bytes_read += data.len() as u64;
                self.process(&data)?;
                Ok(true)
            }
            Chunk::Timeout => {
                self.stats.timeouts += 1;
                Ok(true)
            }
            Chunk::EndOfStream => {
                log::info!("Source reached end of stream");
                self.stats.stop_reason = StopReason::EndOfStream;
                Ok(false)
            }
        }
    }

    fn process(&mut self, data: &[u8]) -> Result<()> {
        let mut decoded = Vec::new();

        match &mut self.framer {
            Framer::Markers { sync, codec } => {
                sync.feed(data);
                while let Some(result) = sync.next_result() {
                    match result {
                        SyncResult::Frame(raw) => {
                            self.stats.frames_synced += 1;
                            if let Some(frame) = decode_raw(codec, raw, &mut self.stats) {
                                decoded.push(frame);
                            }
                        }
                        SyncResult::Malformed(Malformed::Ordering { .. }) => {
                            self.stats.malformed_ordering += 1;
                        }
                        SyncResult::Malformed(Malformed::Oversized { .. }) => {
                            self.stats.oversized += 1;
                        }
                        SyncResult::Pending => break,
                    }
                }
            }
            Framer::Lines(asm) => {
                let frames = asm.feed(data);
                self.stats.frames_synced += frames.len() as u64;
                decoded.extend(frames);
            }
        }

        for frame in &decoded {
            self.sink.accept(frame)?;
            self.stats.frames_delivered += 1;
            if let Some(capture) = &self.capture {
                capture.record_frame();
            }
        }
        Ok(())
    }
}

fn decode_raw(codec: &PixelCodec, raw: RawFrame, stats: &mut PipelineStats) -> Option<PixelFrame> {
    match codec.decode(&raw.payload) {
        Ok(decoded) => {
            match decoded.adjustment {
                Some(SizeAdjustment::Truncated { .. }) => stats.truncated += 1,
                Some(SizeAdjustment::Padded { added }) => {
                    log::debug!("Frame {} padded with {} bytes", raw.sequence, added);
                    stats.padded += 1;
                }
                None => {}
            }
            let mut frame = decoded.frame;
            frame.sequence = raw.sequence;
            Some(frame)
        }
        Err(e) => {
            match e {
                DecodeError::SizeMismatch { .. } => stats.size_mismatch += 1,
                DecodeError::MalformedPayload(_) => stats.malformed_payload += 1,
            }
            log::warn!(
                "Skipping frame {} ({} bytes at stream {}..{}): {}",
                raw.sequence,
                raw.len(),
                raw.provenance.start,
                raw.provenance.end,
                e
            );
            None
        }
    }
}
