//! `serial-cam` command line entry point
//!
//! Usage: `serial-cam [config.json]`. Settings not in the file take their
//! defaults; `SERIALCAM_*` environment variables override both.

use anyhow::{Context, Result};
use std::path::PathBuf;

use serial_cam_lib::config::StreamConfig;
use serial_cam_lib::pipeline::StopSignal;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let info = serial_cam_lib::build_info();
    log::info!(
        "serial-cam {} ({}, built {})",
        info.version,
        info.git_hash,
        info.build_time
    );

    let mut config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => StreamConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => StreamConfig::default(),
    };
    config.apply_env();
    config.validate().context("invalid configuration")?;

    let stop = StopSignal::new();
    spawn_interrupt_handler(stop.clone())?;

    let stats = serial_cam_lib::run(config, stop).context("stream failed")?;
    log::info!("Final stats: {}", serde_json::to_string(&stats)?);
    Ok(())
}

/// Raise `stop` on Ctrl-C
fn spawn_interrupt_handler(stop: StopSignal) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("creating signal runtime")?;

    std::thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        log::info!("Interrupt received, stopping");
                        stop.stop();
                    }
                    Err(e) => log::warn!("Cannot listen for Ctrl-C: {}", e),
                }
            });
        })
        .context("spawning signal thread")?;
    Ok(())
}
