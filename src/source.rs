//! Byte sources feeding the synchronizer
//!
//! A source hands out whatever bytes the transport has, in chunks of any
//! size. A read that times out is not an error: the pipeline just loops.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Depth of the device reader's hand-off channel, in chunks
const DEVICE_CHANNEL_DEPTH: usize = 64;
/// Size of each read issued by the device reader thread
const DEVICE_READ_SIZE: usize = 4096;
/// Pause after a zero-length device read before reading again
const DEVICE_IDLE_BACKOFF: Duration = Duration::from_millis(5);

/// Transport failures. These end the pipeline.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Device could not be opened
    #[error("failed to open {path}: {source}")]
    Open {
        /// Device path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// Read failed
    #[error("read error: {0}")]
    Io(#[from] io::Error),
    /// Reader thread went away without signalling end of stream
    #[error("device disconnected")]
    Disconnected,
    /// Read attempted after `close()`
    #[error("source is closed")]
    Closed,
}

/// Result type for source operations
pub type Result<T> = std::result::Result<T, SourceError>;

/// Outcome of a single read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Bytes received (never empty)
    Data(Vec<u8>),
    /// Nothing arrived within the read timeout
    Timeout,
    /// The source has no more bytes and never will
    EndOfStream,
}

/// Something that produces the raw serial byte stream
pub trait ByteSource: Send {
    /// Read up to `max_bytes`, blocking at most for the source's timeout
    ///
    /// # Errors
    /// Returns [`SourceError`] when the transport has failed permanently.
    fn read(&mut self, max_bytes: usize) -> Result<Chunk>;

    /// Release the transport
    ///
    /// # Errors
    /// Returns [`SourceError`] if releasing the transport fails.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn read(&mut self, max_bytes: usize) -> Result<Chunk> {
        (**self).read(max_bytes)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Pre-scripted source for tests and offline decoding
#[derive(Debug, Default)]
pub struct MemorySource {
    script: VecDeque<Chunk>,
    closed: bool,
}

impl MemorySource {
    /// Serve `data` in chunks of `chunk_size` bytes
    pub fn from_bytes(data: &[u8], chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            script: data
                .chunks(chunk_size)
                .map(|c| Chunk::Data(c.to_vec()))
                .collect(),
            closed: false,
        }
    }

    /// Serve each chunk as given
    pub fn from_chunks(chunks: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            script: chunks
                .into_iter()
                .filter(|c| !c.is_empty())
                .map(Chunk::Data)
                .collect(),
            closed: false,
        }
    }

    /// Append a simulated read timeout
    pub fn push_timeout(&mut self) {
        self.script.push_back(Chunk::Timeout);
    }

    /// Append more bytes
    pub fn push_data(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.script.push_back(Chunk::Data(data));
        }
    }

    /// Whether `close()` was called
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ByteSource for MemorySource {
    fn read(&mut self, max_bytes: usize) -> Result<Chunk> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        match self.script.pop_front() {
            Some(Chunk::Data(mut data)) if data.len() > max_bytes.max(1) => {
                let rest = data.split_off(max_bytes.max(1));
                self.script.push_front(Chunk::Data(rest));
                Ok(Chunk::Data(data))
            }
            Some(chunk) => Ok(chunk),
            None => Ok(Chunk::EndOfStream),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Adapts any [`Read`] into a byte source
///
/// `TimedOut`/`WouldBlock`/`Interrupted` become [`Chunk::Timeout`] and a
/// zero-length read becomes [`Chunk::EndOfStream`].
#[derive(Debug)]
pub struct ReaderSource<R: Read + Send> {
    reader: Option<R>,
}

impl<R: Read + Send> ReaderSource<R> {
    /// Wrap a reader
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
        }
    }
}

impl<R: Read + Send> ByteSource for ReaderSource<R> {
    fn read(&mut self, max_bytes: usize) -> Result<Chunk> {
        let reader = self.reader.as_mut().ok_or(SourceError::Closed)?;
        let mut buf = vec![0u8; max_bytes.max(1)];
        match reader.read(&mut buf) {
            Ok(0) => Ok(Chunk::EndOfStream),
            Ok(n) => {
                buf.truncate(n);
                Ok(Chunk::Data(buf))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Chunk::Timeout)
            }
            Err(e) => Err(SourceError::Io(e)),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

/// Message from the device reader thread
enum DeviceMessage {
    Data(Vec<u8>),
    Failed(io::Error),
}

/// Serial device opened as a file, read on a helper thread
///
/// Line settings (baud rate, raw mode) are expected to be configured on the
/// device beforehand. The helper thread lets `read` honour a timeout on
/// platforms where the device file itself blocks indefinitely.
///
/// A serial line never ends by itself: a zero-length read (a tty in
/// non-blocking or `VTIME` mode with nothing to say) is a quiet period and
/// surfaces as [`Chunk::Timeout`]. Only a read error or `close()` stops it.
pub struct DeviceSource {
    path: PathBuf,
    timeout: Duration,
    receiver: Option<Receiver<DeviceMessage>>,
    stop: Arc<AtomicBool>,
    /// Bytes received but not yet handed out (read asked for fewer)
    pending: Vec<u8>,
    finished: bool,
}

impl DeviceSource {
    /// Open `path` and start the reader thread
    ///
    /// # Errors
    /// Returns [`SourceError::Open`] if the device cannot be opened.
    pub fn open(path: &Path, timeout: Duration) -> Result<Self> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Opened serial device {}", path.display());
        Ok(Self::spawn(file, path.to_path_buf(), timeout))
    }

    fn spawn<R: Read + Send + 'static>(mut reader: R, path: PathBuf, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::sync_channel(DEVICE_CHANNEL_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let name = path.display().to_string();

        thread::spawn(move || {
            let mut buf = vec![0u8; DEVICE_READ_SIZE];
            while !stop_thread.load(Ordering::Relaxed) {
                let msg = match reader.read(&mut buf) {
                    Ok(0) => {
                        thread::sleep(DEVICE_IDLE_BACKOFF);
                        continue;
                    }
                    Ok(n) => DeviceMessage::Data(buf[..n].to_vec()),
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::TimedOut
                                | io::ErrorKind::WouldBlock
                                | io::ErrorKind::Interrupted
                        ) =>
                    {
                        continue
                    }
                    Err(e) => DeviceMessage::Failed(e),
                };
                let last = matches!(msg, DeviceMessage::Failed(_));
                if tx.send(msg).is_err() || last {
                    break;
                }
            }
            log::debug!("Reader thread for {} exiting", name);
        });

        Self {
            path,
            timeout,
            receiver: Some(rx),
            stop,
            pending: Vec::new(),
            finished: false,
        }
    }

    /// Device path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn hand_out(&mut self, mut data: Vec<u8>, max_bytes: usize) -> Chunk {
        let max_bytes = max_bytes.max(1);
        if data.len() > max_bytes {
            self.pending = data.split_off(max_bytes);
        }
        Chunk::Data(data)
    }
}

impl ByteSource for DeviceSource {
    fn read(&mut self, max_bytes: usize) -> Result<Chunk> {
        if !self.pending.is_empty() {
            let data = std::mem::take(&mut self.pending);
            return Ok(self.hand_out(data, max_bytes));
        }
        if self.finished {
            return Ok(Chunk::EndOfStream);
        }
        let receiver = self.receiver.as_ref().ok_or(SourceError::Closed)?;

        match receiver.recv_timeout(self.timeout) {
            Ok(DeviceMessage::Data(data)) => Ok(self.hand_out(data, max_bytes)),
            Ok(DeviceMessage::Failed(e)) => {
                log::warn!("{} read failed: {}", self.path.display(), e);
                self.finished = true;
                Err(SourceError::Io(e))
            }
            Err(RecvTimeoutError::Timeout) => Ok(Chunk::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(SourceError::Disconnected),
        }
    }

    fn close(&mut self) -> Result<()> {
        // The thread may be parked in a blocking read; it exits once that returns
        self.stop.store(true, Ordering::Relaxed);
        self.receiver = None;
        self.pending.clear();
        log::info!("Closed serial device {}", self.path.display());
        Ok(())
    }
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_memory_source_respects_max_bytes() {
        let mut src = MemorySource::from_bytes(&[1, 2, 3, 4, 5], 5);
        assert_eq!(src.read(2).unwrap(), Chunk::Data(vec![1, 2]));
        assert_eq!(src.read(10).unwrap(), Chunk::Data(vec![3, 4, 5]));
        assert_eq!(src.read(10).unwrap(), Chunk::EndOfStream);
    }

    #[test]
    fn test_memory_source_timeouts_and_close() {
        let mut src = MemorySource::from_chunks(vec![vec![1]]);
        src.push_timeout();
        src.push_data(vec![2]);
        assert_eq!(src.read(8).unwrap(), Chunk::Data(vec![1]));
        assert_eq!(src.read(8).unwrap(), Chunk::Timeout);
        assert_eq!(src.read(8).unwrap(), Chunk::Data(vec![2]));

        src.close().unwrap();
        assert!(src.is_closed());
        assert!(matches!(src.read(8), Err(SourceError::Closed)));
    }

    #[test]
    fn test_reader_source_eof() {
        let mut src = ReaderSource::new(Cursor::new(vec![7u8; 5]));
        assert_eq!(src.read(3).unwrap(), Chunk::Data(vec![7; 3]));
        assert_eq!(src.read(3).unwrap(), Chunk::Data(vec![7; 2]));
        assert_eq!(src.read(3).unwrap(), Chunk::EndOfStream);
    }

    struct FlakyReader {
        calls: usize,
    }

    impl Read for FlakyReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls += 1;
            match self.calls {
                1 => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
                2 => {
                    buf[0] = 0x42;
                    Ok(1)
                }
                _ => Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
            }
        }
    }

    #[test]
    fn test_reader_source_maps_errors() {
        let mut src = ReaderSource::new(FlakyReader { calls: 0 });
        assert_eq!(src.read(8).unwrap(), Chunk::Timeout);
        assert_eq!(src.read(8).unwrap(), Chunk::Data(vec![0x42]));
        assert!(matches!(src.read(8), Err(SourceError::Io(_))));
    }

    /// Read from a device until `len` bytes arrived, failing on end of stream
    fn read_device(src: &mut DeviceSource, len: usize, max_bytes: usize) -> Vec<u8> {
        let mut got = Vec::new();
        while got.len() < len {
            match src.read(max_bytes).unwrap() {
                Chunk::Data(d) => {
                    assert!(d.len() <= max_bytes);
                    got.extend(d);
                }
                Chunk::Timeout => continue,
                Chunk::EndOfStream => panic!("device stream ended after {} bytes", got.len()),
            }
        }
        got
    }

    #[test]
    fn test_device_source_over_reader_thread() {
        let data: Vec<u8> = (0..10).collect();
        let mut src = DeviceSource::spawn(
            Cursor::new(data.clone()),
            PathBuf::from("mem"),
            Duration::from_secs(2),
        );

        assert_eq!(read_device(&mut src, data.len(), 4), data);
        // Exhausted reader is a quiet line, not a hang-up
        assert_eq!(src.read(4).unwrap(), Chunk::Timeout);
        src.close().unwrap();
        assert!(matches!(src.read(4), Err(SourceError::Closed)));
    }

    /// Tty in `VTIME` mode: quiet periods read as zero bytes
    struct QuietLine {
        calls: usize,
    }

    impl Read for QuietLine {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls += 1;
            match self.calls {
                4 => {
                    buf[0] = 0x42;
                    Ok(1)
                }
                _ => Ok(0),
            }
        }
    }

    #[test]
    fn test_device_source_zero_length_read_is_quiet_period() {
        let mut src = DeviceSource::spawn(
            QuietLine { calls: 0 },
            PathBuf::from("tty"),
            Duration::from_millis(20),
        );

        let mut reads = Vec::new();
        loop {
            let chunk = src.read(8).unwrap();
            assert_ne!(chunk, Chunk::EndOfStream);
            let done = matches!(chunk, Chunk::Data(_));
            reads.push(chunk);
            if done {
                break;
            }
            assert!(reads.len() < 500, "byte after the quiet period never arrived");
        }
        assert_eq!(reads.last(), Some(&Chunk::Data(vec![0x42])));
        assert_eq!(src.read(8).unwrap(), Chunk::Timeout);
        src.close().unwrap();
    }

    #[test]
    fn test_device_source_read_error_ends_stream() {
        let mut src = DeviceSource::spawn(
            FlakyReader { calls: 0 },
            PathBuf::from("tty"),
            Duration::from_secs(2),
        );

        assert_eq!(read_device(&mut src, 1, 8), vec![0x42]);
        let err = loop {
            match src.read(8) {
                Ok(Chunk::Timeout) => continue,
                other => break other,
            }
        };
        assert!(matches!(err, Err(SourceError::Io(_))));
        assert_eq!(src.read(8).unwrap(), Chunk::EndOfStream);
    }

    #[test]
    fn test_device_source_open_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let result = DeviceSource::open(&dir.path().join("ttyNOPE"), Duration::from_millis(10));
        assert!(matches!(result, Err(SourceError::Open { .. })));
    }

    #[test]
    fn test_device_source_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ttyFAKE");
        std::fs::write(&path, b"hello").unwrap();

        let mut src = DeviceSource::open(&path, Duration::from_secs(2)).unwrap();
        assert_eq!(read_device(&mut src, 5, 64), b"hello");
        assert_eq!(src.path(), path.as_path());
        src.close().unwrap();
    }
}
