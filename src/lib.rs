//! `serial-cam` - Frame synchronizer and pixel decoder for serial camera links
//!
//! A microcontroller camera streams frames over a serial link as
//! `START || PAYLOAD || END`. This crate recovers frame boundaries from the
//! arbitrarily split byte stream ([`frame_sync`]), decodes payloads into
//! RGB888 images or binary masks ([`pixel_codec`], [`mask_assembler`]) and
//! hands them to a sink ([`sink`]), all driven by a single pull loop
//! ([`pipeline`]).

pub mod capture;
pub mod config;
pub mod frame_sync;
pub mod marker_scan;
pub mod mask_assembler;
pub mod pipeline;
pub mod pixel_codec;
pub mod replay;
pub mod sink;
pub mod source;

#[doc(hidden)]
pub mod test_utils;

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::capture::{CaptureError, CaptureMetadata, CaptureState, CapturingSource};
use crate::config::{ConfigError, OutputKind, StreamConfig};
use crate::pipeline::{Pipeline, PipelineError, PipelineStats, StopSignal};
use crate::replay::{CaptureReplay, ReplayConfig, ReplayError};
use crate::sink::{FrameSink, LatestFrameSink, LatestOnlySink, PngSink, RawFileSink, SinkError, SinkPolicy};
use crate::source::{ByteSource, DeviceSource, SourceError};

/// Errors from setting up or running a session
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Device could not be opened
    #[error(transparent)]
    Source(#[from] SourceError),
    /// Sink could not be created
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// Capture file could not be loaded
    #[error(transparent)]
    Replay(#[from] ReplayError),
    /// Recording could not be started or saved
    #[error(transparent)]
    Capture(#[from] CaptureError),
    /// The loop failed
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Build information
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    /// Package version
    pub version: String,
    /// Git commit hash (short)
    pub git_hash: String,
    /// Build timestamp
    pub build_time: String,
}

/// Version and build stamp of this binary
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("BUILD_GIT_HASH").to_string(),
        build_time: env!("BUILD_TIMESTAMP").to_string(),
    }
}

/// Open the configured byte source
///
/// A replay file takes precedence over the device. When replaying, link
/// settings recorded in the capture's metadata are written into `config`.
///
/// # Errors
/// Returns [`AppError`] if the device or capture file cannot be opened.
pub fn build_source(config: &mut StreamConfig) -> Result<Box<dyn ByteSource>, AppError> {
    if let Some(path) = config.replay_file.clone() {
        let mut replay = CaptureReplay::load(&path)?;
        replay.apply_metadata(config);
        replay.set_config(ReplayConfig::from_stream(config));
        log::info!(
            "Replaying {} ({} chunks, {} ms) at {}x",
            path.display(),
            replay.chunk_count(),
            replay.duration_ms(),
            config.replay_speed
        );
        return Ok(Box::new(replay.into_source(config.read_timeout())));
    }

    log::info!(
        "Opening {} (configured for {} baud)",
        config.port,
        config.baud
    );
    let device = DeviceSource::open(std::path::Path::new(&config.port), config.read_timeout())?;
    Ok(Box::new(device))
}

/// Create the configured sink, wrapped for the configured backpressure policy
///
/// # Errors
/// Returns [`SinkError`] if the output directory cannot be created.
pub fn build_sink(config: &StreamConfig) -> Result<Box<dyn FrameSink>, SinkError> {
    let sink: Box<dyn FrameSink> = match config.output {
        OutputKind::Preview => Box::new(LatestFrameSink::new()),
        OutputKind::Raw => Box::new(RawFileSink::new(&config.output_dir)?),
        OutputKind::Png => Box::new(PngSink::new(
            &config.output_dir,
            config.png_scale,
            config.bgr_output,
        )?),
    };

    Ok(match config.sink_policy {
        SinkPolicy::Block => sink,
        SinkPolicy::DropOldest => Box::new(LatestOnlySink::new(sink)),
    })
}

/// Run one session until `stop` is raised or the source ends
///
/// Validates `config`, opens the source and sink, optionally records the raw
/// stream to `capture_dir`, and returns the final counters.
///
/// # Errors
/// Returns [`AppError`] on invalid configuration or a fatal source/sink error.
pub fn run(mut config: StreamConfig, stop: StopSignal) -> Result<PipelineStats, AppError> {
    config.validate()?;
    let source = build_source(&mut config)?;
    // Replay metadata may have changed the link settings
    config.validate()?;
    let sink = build_sink(&config)?;
    if !config.output.keeps_frames() {
        log::warn!(
            "Output is \"preview\": nothing reads the latest frame outside the library, \
             decoded frames are discarded (set output to \"png\" or \"raw\" to save them)"
        );
    }

    let Some(capture_dir) = config.capture_dir.clone() else {
        let mut pipeline = Pipeline::new(source, sink, &config).with_stop_signal(stop);
        return Ok(pipeline.run()?);
    };

    std::fs::create_dir_all(&capture_dir).map_err(CaptureError::from)?;
    let capture = Arc::new(CaptureState::new());
    capture.start_capture(CaptureMetadata::from_config(&config))?;
    let source = CapturingSource::new(source, Arc::clone(&capture));
    let mut pipeline = Pipeline::new(source, sink, &config)
        .with_stop_signal(stop)
        .with_capture(Arc::clone(&capture));

    let outcome = pipeline.run();
    // Keep whatever was recorded, even when the loop failed
    match capture.stop_capture(&capture_dir) {
        Ok(result) => log::info!(
            "Capture saved: {} ({} chunks, {} bytes)",
            result.capture_path.display(),
            result.metadata.total_chunks,
            result.metadata.total_bytes
        ),
        Err(e) => {
            log::error!("Failed to save capture: {}", e);
            outcome?;
            return Err(e.into());
        }
    }
    Ok(outcome?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{write_capture_file, CapturedChunk};
    use crate::test_utils::{frame_stream, rgb565_frame, Rgb};
    use tempfile::tempdir;

    #[test]
    fn test_build_info_is_stamped() {
        let info = build_info();
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert!(!info.build_time.is_empty());
    }

    #[test]
    fn test_run_replay_to_raw_files() {
        let dir = tempdir().unwrap();
        let capture_path = dir.path().join("capture_1.bin");
        let stream = frame_stream(&[
            rgb565_frame(4, 2, Rgb::RED),
            rgb565_frame(4, 2, Rgb::BLUE),
        ]);
        write_capture_file(
            &capture_path,
            &[CapturedChunk {
                timestamp_us: 0,
                data: stream,
            }],
        )
        .unwrap();

        let out = dir.path().join("frames");
        let config = StreamConfig {
            width: 4,
            height: 2,
            output: OutputKind::Raw,
            output_dir: out.clone(),
            replay_file: Some(capture_path),
            replay_speed: 0.0,
            ..StreamConfig::default()
        };

        let stats = run(config, StopSignal::new()).unwrap();
        assert_eq!(stats.frames_delivered, 2);
        assert!(out.join("frame_000001_4x2.rgb").exists());
    }

    #[test]
    fn test_run_records_capture() {
        let dir = tempdir().unwrap();
        let capture_path = dir.path().join("input.bin");
        write_capture_file(
            &capture_path,
            &[CapturedChunk {
                timestamp_us: 0,
                data: frame_stream(&[rgb565_frame(2, 2, Rgb::WHITE)]),
            }],
        )
        .unwrap();

        let captures = dir.path().join("captures");
        let config = StreamConfig {
            width: 2,
            height: 2,
            replay_file: Some(capture_path),
            replay_speed: 0.0,
            capture_dir: Some(captures.clone()),
            ..StreamConfig::default()
        };

        let stats = run(config, StopSignal::new()).unwrap();
        assert_eq!(stats.frames_delivered, 1);

        let recorded: Vec<_> = std::fs::read_dir(&captures)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        assert!(recorded.iter().any(|p| p.extension().is_some_and(|e| e == "bin")));
        assert!(recorded.iter().any(|p| p.extension().is_some_and(|e| e == "json")));
    }

    #[test]
    fn test_run_rejects_invalid_config() {
        let config = StreamConfig {
            width: 0,
            ..StreamConfig::default()
        };
        assert!(matches!(
            run(config, StopSignal::new()),
            Err(AppError::Config(_))
        ));
    }
}
