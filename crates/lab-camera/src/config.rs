//! Application configuration
//!
//! Loaded from an optional TOML file layered with `LAB_CAMERA__*`
//! environment variables (`__` separates nesting levels, e.g.
//! `LAB_CAMERA__WRITER__FPS=25`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camera_capture::{AcquisitionConfig, CameraId, RegistryConfig};
use config::{Config, ConfigError, Environment, File};
use frame_handlers::{ColorMode, VideoWriterConfig};
use serde::Deserialize;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "LAB_CAMERA";

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    /// Directory recordings are written to
    pub output_dir: PathBuf,
    pub cameras: Vec<CameraDefinition>,
    pub writer: WriterSettings,
    pub display: DisplaySettings,
    pub acquisition: AcquisitionSettings,
    pub simulation: SimulationSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            output_dir: PathBuf::from("recordings"),
            cameras: (1..=4)
                .map(|n| CameraDefinition {
                    name: format!("camera{}", n),
                    id: format!("cam{}", n),
                    settings_file: None,
                })
                .collect(),
            writer: WriterSettings::default(),
            display: DisplaySettings::default(),
            acquisition: AcquisitionSettings::default(),
            simulation: SimulationSettings::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `camera_capture=debug`.
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// One physical camera in the lab setup
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CameraDefinition {
    /// Station name, also the recording file prefix
    pub name: String,
    /// Vendor camera id
    pub id: String,
    /// Camera settings applied when the camera appears
    #[serde(default)]
    pub settings_file: Option<PathBuf>,
}

impl CameraDefinition {
    pub fn camera_id(&self) -> CameraId {
        CameraId::new(self.id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSetting {
    Grayscale,
    Color,
}

impl From<ColorSetting> for ColorMode {
    fn from(setting: ColorSetting) -> Self {
        match setting {
            ColorSetting::Grayscale => ColorMode::Grayscale,
            ColorSetting::Color => ColorMode::Color,
        }
    }
}

/// Recording container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// `.mp4` through an ffmpeg subprocess
    Ffmpeg,
    /// Uncompressed `.y4m`
    Y4m,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterSettings {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub color: ColorSetting,
    pub encoder: EncoderKind,
    pub max_consecutive_write_failures: Option<u32>,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            fps: 10,
            width: 640,
            height: 480,
            color: ColorSetting::Grayscale,
            encoder: EncoderKind::Ffmpeg,
            max_consecutive_write_failures: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    pub queue_capacity: usize,
    pub lock_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1,
            lock_timeout_ms: 1000,
            poll_interval_ms: 20,
        }
    }
}

/// Simulated cameras used when no vendor SDK is linked
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub fps: u32,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self { fps: 10 }
    }
}

impl AppConfig {
    /// Load configuration from `path` (if any) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Reject configurations the acquisition core cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Message(msg));

        if self.writer.fps == 0 {
            return invalid("writer.fps must be at least 1".to_string());
        }
        if self.writer.width == 0 || self.writer.height == 0 {
            return invalid("writer frame size must be non-zero".to_string());
        }
        if self.display.width == 0 || self.display.height == 0 {
            return invalid("display size must be non-zero".to_string());
        }
        if self.acquisition.queue_capacity == 0 {
            return invalid("acquisition.queue_capacity must be at least 1".to_string());
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for camera in &self.cameras {
            if !names.insert(camera.name.as_str()) {
                return invalid(format!("duplicate camera name {}", camera.name));
            }
            if !ids.insert(camera.id.as_str()) {
                return invalid(format!("duplicate camera id {}", camera.id));
            }
        }
        Ok(())
    }

    pub fn acquisition_config(&self) -> AcquisitionConfig {
        AcquisitionConfig {
            queue_capacity: self.acquisition.queue_capacity,
            lock_timeout: Duration::from_millis(self.acquisition.lock_timeout_ms),
            poll_interval: Duration::from_millis(self.acquisition.poll_interval_ms),
            ..Default::default()
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            lock_timeout: Duration::from_millis(self.acquisition.lock_timeout_ms),
            acquisition: self.acquisition_config(),
        }
    }

    /// Writer configuration for one camera station
    pub fn writer_config(&self, camera: &CameraDefinition) -> VideoWriterConfig {
        VideoWriterConfig {
            name: camera.name.clone(),
            output_dir: self.output_dir.clone(),
            fps: self.writer.fps,
            frame_size: (self.writer.width, self.writer.height),
            color: self.writer.color.into(),
            max_consecutive_write_failures: self.writer.max_consecutive_write_failures,
            lock_timeout: Duration::from_millis(self.acquisition.lock_timeout_ms),
        }
    }

    pub fn display_size(&self) -> (u32, u32) {
        (self.display.width, self.display.height)
    }
}
