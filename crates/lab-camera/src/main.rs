//! Lab Camera Station - Main Entry Point
//!
//! Runs the acquisition core against simulated cameras, one per configured
//! station, and reports station status until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camera_capture::sim::{SimCamera, SimCameraSystem};
use camera_capture::{CameraRegistry, PixelFormat};
use clap::Parser;
use frame_handlers::ColorMode;
use lab_camera::{init_logging, AppConfig, StationBoard};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Hot-plug lab camera acquisition and recording")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "LAB_CAMERA_CONFIG")]
    config: Option<PathBuf>,

    /// Directory recordings are written to
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Log level or filter directive
    #[arg(long)]
    log_level: Option<String>,

    /// Frame rate of the simulated cameras
    #[arg(long)]
    sim_fps: Option<u32>,

    /// Start recording on every station as its camera appears
    #[arg(long)]
    record: bool,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    duration: Option<u64>,

    /// Seconds between status reports
    #[arg(long, default_value_t = 5)]
    status_interval: u64,
}

fn simulated_system(config: &AppConfig) -> SimCameraSystem {
    let format = match ColorMode::from(config.writer.color) {
        ColorMode::Grayscale => PixelFormat::Mono8,
        ColorMode::Color => PixelFormat::Rgb8,
    };
    let cameras = config
        .cameras
        .iter()
        .map(|definition| {
            let (camera, _probe) = SimCamera::new(
                definition.camera_id(),
                config.writer.width,
                config.writer.height,
                format,
                config.simulation.fps,
            );
            camera
        })
        .collect();
    SimCameraSystem::with_cameras(cameras)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(fps) = args.sim_fps {
        config.simulation.fps = fps;
    }
    config.validate().context("invalid configuration")?;

    init_logging(&config.logging)?;

    info!("=== Lab Camera v{} ===", env!("CARGO_PKG_VERSION"));
    info!(
        "{} stations, recordings in {}",
        config.cameras.len(),
        config.output_dir.display()
    );

    let board = Arc::new(StationBoard::from_config(&config)?.with_auto_record(args.record));
    let registry = CameraRegistry::new(config.registry_config());
    registry.subscribe(board.listener());
    registry.start(Box::new(simulated_system(&config)))?;

    let shutdown = async {
        match args.duration {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                }
            }
        }
    };
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => board.log_status(),
        }
    }

    info!("Shutting down");
    board.shutdown();
    // Joins the registry and acquisition threads
    tokio::task::spawn_blocking(move || registry.quit())
        .await
        .context("registry shutdown panicked")?;
    board.log_status();

    Ok(())
}
