//! Camera Acquisition Core
//!
//! Pulls frames from hot-pluggable lab cameras and fans the newest frame out
//! to pluggable frame handlers. Provides:
//! - A vendor SDK seam (`sdk`) and a simulated SDK (`sim`)
//! - The frame handler contract with synchronous lifecycle notifications
//! - One acquisition thread per camera with demand-driven streaming
//! - A hot-plug registry owning the camera-id -> handler map

pub mod acquisition;
pub mod frame;
pub mod handler;
pub mod registry;
pub mod sdk;
pub mod sim;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use acquisition::{AcquisitionConfig, AcquisitionState, AcquisitionStats, CameraHandler};
pub use frame::{Frame, PixelFormat};
pub use handler::{
    FrameHandler, HandlerError, HandlerEvent, HandlerKind, HandlerListener, HandlerNotifier,
    ListenerId,
};
pub use registry::{CameraRegistry, RegistryConfig, RegistryEvent, RegistryListener, RegistryState};
pub use sdk::{CameraDevice, CameraSystem, DriverFrame, FrameCallback, FrameStatus, HotPlugEvent};
pub use worker::{StopSignal, Worker};

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Camera error types
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to open camera: {0}")]
    Open(String),

    #[error("Invalid format: {0}")]
    Format(String),

    #[error("Streaming error: {0}")]
    Stream(String),

    #[error("Failed to load settings from {path}: {reason}")]
    Settings { path: PathBuf, reason: String },

    #[error("Camera system error: {0}")]
    System(String),

    #[error("Timed out waiting for lock: {0}")]
    LockTimeout(&'static str),

    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    #[error("Already running")]
    AlreadyRunning,

    #[error("Camera {0} has been shut down")]
    Terminated(CameraId),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Thread error: {0}")]
    Thread(#[from] std::io::Error),
}

/// Vendor-assigned camera identifier, stable across hot-plug cycles
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraId(String);

impl CameraId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CameraId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CameraId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
