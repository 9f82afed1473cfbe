//! Frame sinks
//!
//! Where decoded frames end up: files on disk, an in-memory latest-frame slot
//! for a preview, or a collector for tests. [`LatestOnlySink`] decouples a slow
//! sink from the read loop by keeping only the newest undelivered frame.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::{imageops, ImageBuffer, Luma, Rgb};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pixel_codec::{to_bgr888, PixelFormat, PixelFrame};

/// Sink errors. These end the pipeline.
#[derive(Error, Debug)]
pub enum SinkError {
    /// File write failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// PNG encoding failed
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    /// Frame could not be handed to the image encoder
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// Background delivery failed earlier
    #[error("sink worker failed: {0}")]
    Worker(String),
    /// Shared state lock poisoned
    #[error("lock poisoned: {0}")]
    Lock(String),
}

/// Result type for sink operations
pub type Result<T> = std::result::Result<T, SinkError>;

/// Broad category of a sink, used to pick defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Continuous display; stale or partial frames are worse than gaps
    Preview,
    /// Single-shot or recording to disk
    File,
}

/// What the read loop does when the sink is slower than the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkPolicy {
    /// Deliver inline; a slow sink slows the read loop
    #[default]
    Block,
    /// Deliver on a worker thread, keeping only the newest pending frame
    DropOldest,
}

/// Consumer of decoded frames
pub trait FrameSink: Send {
    /// Take one frame
    ///
    /// # Errors
    /// Returns [`SinkError`] if the frame cannot be stored or displayed.
    fn accept(&mut self, frame: &PixelFrame) -> Result<()>;

    /// Deliver anything still pending; called once when the pipeline stops
    ///
    /// # Errors
    /// Returns [`SinkError`] if pending delivery fails.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn accept(&mut self, frame: &PixelFrame) -> Result<()> {
        (**self).accept(frame)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// File name for a raw frame dump
pub fn raw_frame_name(frame: &PixelFrame) -> String {
    let ext = match frame.format {
        PixelFormat::Rgb888 => "rgb",
        PixelFormat::BinaryMask => "mask",
    };
    format!(
        "frame_{:06}_{}x{}.{}",
        frame.sequence, frame.width, frame.height, ext
    )
}

/// Writes each frame's packed pixel buffer to its own file
#[derive(Debug)]
pub struct RawFileSink {
    dir: PathBuf,
    written: u64,
    last_path: Option<PathBuf>,
}

impl RawFileSink {
    /// Create the output directory if needed
    ///
    /// # Errors
    /// Returns [`SinkError::Io`] if the directory cannot be created.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            written: 0,
            last_path: None,
        })
    }

    /// Frames written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Path of the most recent file
    pub fn last_path(&self) -> Option<&Path> {
        self.last_path.as_deref()
    }
}

impl FrameSink for RawFileSink {
    fn accept(&mut self, frame: &PixelFrame) -> Result<()> {
        let path = self.dir.join(raw_frame_name(frame));
        fs::write(&path, &frame.data)?;
        log::debug!("Wrote {} bytes to {}", frame.data.len(), path.display());
        self.written += 1;
        self.last_path = Some(path);
        Ok(())
    }
}

/// Writes each frame as a PNG
///
/// Masks become black/white grayscale. `scale` enlarges each pixel into a
/// `scale`×`scale` block, which keeps 160×120 sensor frames viewable.
#[derive(Debug)]
pub struct PngSink {
    dir: PathBuf,
    scale: u32,
    bgr: bool,
    written: u64,
    last_path: Option<PathBuf>,
}

impl PngSink {
    /// Create the output directory if needed
    ///
    /// # Errors
    /// Returns [`SinkError::Io`] if the directory cannot be created.
    pub fn new(dir: &Path, scale: u32, bgr: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            scale: scale.max(1),
            bgr,
            written: 0,
            last_path: None,
        })
    }

    /// Frames written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Path of the most recent file
    pub fn last_path(&self) -> Option<&Path> {
        self.last_path.as_deref()
    }

    fn encode(&self, frame: &PixelFrame, path: &Path) -> Result<()> {
        let (w, h) = (frame.width, frame.height);
        let (sw, sh) = (w * self.scale, h * self.scale);

        match frame.format {
            PixelFormat::Rgb888 => {
                let data = if self.bgr {
                    to_bgr888(&frame.data)
                } else {
                    frame.data.clone()
                };
                let img = ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, data)
                    .ok_or_else(|| SinkError::InvalidFrame(format!("{}x{} RGB buffer", w, h)))?;
                if self.scale > 1 {
                    imageops::resize(&img, sw, sh, imageops::FilterType::Nearest).save(path)?;
                } else {
                    img.save(path)?;
                }
            }
            PixelFormat::BinaryMask => {
                let data = frame.data.iter().map(|&v| if v != 0 { 255 } else { 0 }).collect();
                let img = ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(w, h, data)
                    .ok_or_else(|| SinkError::InvalidFrame(format!("{}x{} mask buffer", w, h)))?;
                if self.scale > 1 {
                    imageops::resize(&img, sw, sh, imageops::FilterType::Nearest).save(path)?;
                } else {
                    img.save(path)?;
                }
            }
        }
        Ok(())
    }
}

impl FrameSink for PngSink {
    fn accept(&mut self, frame: &PixelFrame) -> Result<()> {
        let path = self.dir.join(format!("frame_{:06}.png", frame.sequence));
        self.encode(frame, &path)?;
        log::debug!("Wrote {}", path.display());
        self.written += 1;
        self.last_path = Some(path);
        Ok(())
    }
}

/// The most recent frame and when it arrived
#[derive(Debug, Clone)]
pub struct LatestFrame {
    /// The frame
    pub frame: PixelFrame,
    /// Arrival time
    pub received_at: Instant,
}

/// Shared handle to a [`LatestFrameSink`]'s slot
pub type SharedFrame = Arc<Mutex<Option<LatestFrame>>>;

/// Keeps only the newest frame, readable from other threads (preview)
#[derive(Debug, Default)]
pub struct LatestFrameSink {
    slot: SharedFrame,
    received: u64,
    started: Option<Instant>,
}

impl LatestFrameSink {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for readers
    pub fn handle(&self) -> SharedFrame {
        Arc::clone(&self.slot)
    }

    /// Frames received so far
    pub fn received(&self) -> u64 {
        self.received
    }
}

impl FrameSink for LatestFrameSink {
    fn accept(&mut self, frame: &PixelFrame) -> Result<()> {
        let now = Instant::now();
        let started = *self.started.get_or_insert(now);
        {
            let mut slot = self
                .slot
                .lock()
                .map_err(|e| SinkError::Lock(e.to_string()))?;
            *slot = Some(LatestFrame {
                frame: frame.clone(),
                received_at: now,
            });
        }
        self.received += 1;

        if self.received % 30 == 0 {
            let secs = now.duration_since(started).as_secs_f64();
            if secs > 0.0 {
                log::info!(
                    "Preview: {} frames, {:.1} fps",
                    self.received,
                    self.received as f64 / secs
                );
            }
        }
        Ok(())
    }
}

/// Stores every frame; optionally sleeps per frame to simulate a slow consumer
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    frames: Arc<Mutex<Vec<PixelFrame>>>,
    delay: Option<Duration>,
}

impl CollectingSink {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collector that takes `delay` per frame
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            frames: Arc::default(),
            delay: Some(delay),
        }
    }

    /// Snapshot of everything collected so far
    pub fn frames(&self) -> Vec<PixelFrame> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

impl FrameSink for CollectingSink {
    fn accept(&mut self, frame: &PixelFrame) -> Result<()> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.frames
            .lock()
            .map_err(|e| SinkError::Lock(e.to_string()))?
            .push(frame.clone());
        Ok(())
    }
}

#[derive(Default)]
struct Mailbox {
    frame: Option<PixelFrame>,
    closed: bool,
    failure: Option<String>,
}

type SharedMailbox = Arc<(Mutex<Mailbox>, Condvar)>;

/// Delivers to an inner sink on a worker thread through a single-slot mailbox
///
/// `accept` never waits for the inner sink. A frame still waiting when the
/// next one arrives is overwritten and counted as dropped.
pub struct LatestOnlySink {
    mailbox: SharedMailbox,
    dropped: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl LatestOnlySink {
    /// Start the worker thread around `inner`
    pub fn new<S: FrameSink + 'static>(mut inner: S) -> Self {
        let mailbox: SharedMailbox = Arc::new((Mutex::new(Mailbox::default()), Condvar::new()));
        let delivered = Arc::new(AtomicU64::new(0));
        let worker_mailbox = Arc::clone(&mailbox);
        let worker_delivered = Arc::clone(&delivered);

        let worker = thread::spawn(move || {
            let (lock, cvar) = &*worker_mailbox;
            loop {
                let frame = {
                    let Ok(mut mb) = lock.lock() else { return };
                    while mb.frame.is_none() && !mb.closed {
                        mb = match cvar.wait(mb) {
                            Ok(guard) => guard,
                            Err(_) => return,
                        };
                    }
                    match mb.frame.take() {
                        Some(frame) => frame,
                        None => break,
                    }
                };

                if let Err(e) = inner.accept(&frame) {
                    log::error!("Sink worker failed on frame {}: {}", frame.sequence, e);
                    if let Ok(mut mb) = lock.lock() {
                        mb.failure = Some(e.to_string());
                        mb.closed = true;
                    }
                    return;
                }
                worker_delivered.fetch_add(1, Ordering::Relaxed);
            }

            if let Err(e) = inner.finish() {
                log::error!("Sink worker failed to finish: {}", e);
                if let Ok(mut mb) = lock.lock() {
                    mb.failure = Some(e.to_string());
                }
            }
        });

        Self {
            mailbox,
            dropped: Arc::new(AtomicU64::new(0)),
            delivered,
            worker: Some(worker),
        }
    }

    /// Frames overwritten before the worker picked them up
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames the inner sink accepted
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn shutdown(&mut self) -> Result<()> {
        let (lock, cvar) = &*self.mailbox;
        {
            let mut mb = lock.lock().map_err(|e| SinkError::Lock(e.to_string()))?;
            mb.closed = true;
        }
        cvar.notify_all();

        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| SinkError::Worker("worker thread panicked".to_string()))?;
        }

        let mb = lock.lock().map_err(|e| SinkError::Lock(e.to_string()))?;
        match &mb.failure {
            Some(msg) => Err(SinkError::Worker(msg.clone())),
            None => Ok(()),
        }
    }
}

impl FrameSink for LatestOnlySink {
    fn accept(&mut self, frame: &PixelFrame) -> Result<()> {
        let (lock, cvar) = &*self.mailbox;
        {
            let mut mb = lock.lock().map_err(|e| SinkError::Lock(e.to_string()))?;
            if let Some(msg) = &mb.failure {
                return Err(SinkError::Worker(msg.clone()));
            }
            if let Some(stale) = mb.frame.replace(frame.clone()) {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("Dropped undelivered frame {} ({} total)", stale.sequence, total);
            }
        }
        cvar.notify_one();
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let result = self.shutdown();
        log::info!(
            "Sink worker stopped: {} delivered, {} dropped",
            self.delivered(),
            self.dropped()
        );
        result
    }
}

impl Drop for LatestOnlySink {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.shutdown();
        }
    }
}
