//! Lab Camera Station
//!
//! Application shell around the acquisition core: configuration, logging
//! and the per-camera stations pairing a live preview with a recorder.

pub mod config;
pub mod station;

pub use config::{AppConfig, CameraDefinition, EncoderKind, LoggingConfig};
pub use station::{CameraStation, CameraStatus, StationBoard, StationError};

use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize logging.
///
/// `RUST_LOG` wins over the configured level; an unparsable level falls
/// back to `info`.
pub fn init_logging(config: &LoggingConfig) -> Result<(), SetGlobalDefaultError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true);

    if config.json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
}
