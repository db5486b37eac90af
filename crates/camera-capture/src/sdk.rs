//! Vendor camera SDK seam
//!
//! The acquisition core only talks to camera hardware through these traits.
//! A vendor binding (or the simulator in [`crate::sim`]) implements them.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::frame::PixelFormat;
use crate::{CameraError, CameraId};

/// Driver-reported frame status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// All pixel data arrived
    Complete,
    /// Transfer ended early, buffer contents are partial
    Incomplete,
    /// Buffer was too small for the configured image
    TooSmall,
    /// Driver marked the buffer invalid
    Invalid,
}

/// A frame still owned by the driver
///
/// The borrow ends when the frame callback returns, which is the point where
/// the buffer goes back to the driver. Anything kept longer must be copied
/// (see [`crate::Frame::copy_from`]).
#[derive(Debug)]
pub struct DriverFrame<'a> {
    pub status: FrameStatus,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer: &'a [u8],
    pub timestamp_ns: u64,
    pub sequence: u64,
}

/// Frame callback installed with [`CameraDevice::start_streaming`].
///
/// Invoked on a driver-owned thread; must never block.
pub type FrameCallback = Arc<dyn Fn(&DriverFrame<'_>) + Send + Sync>;

/// One physical camera session
pub trait CameraDevice: Send {
    /// Vendor-assigned camera identifier
    fn id(&self) -> &CameraId;

    /// Enter the camera context (open the session)
    fn open(&mut self) -> Result<(), CameraError>;

    /// Leave the camera context
    fn close(&mut self);

    /// Begin streaming; `callback` receives every frame
    fn start_streaming(&mut self, callback: FrameCallback) -> Result<(), CameraError>;

    /// Stop streaming. Returns once no further callbacks will be made.
    fn stop_streaming(&mut self) -> Result<(), CameraError>;

    fn is_streaming(&self) -> bool;

    /// Apply a camera settings file
    fn load_settings(&mut self, path: &Path) -> Result<(), CameraError>;
}

/// Hot-plug notification from the device-management layer
pub enum HotPlugEvent {
    /// A camera appeared; carries the new session
    Detected(Box<dyn CameraDevice>),
    /// A camera disappeared
    Missing(CameraId),
    Reachable(CameraId),
    Unreachable(CameraId),
    Unknown(CameraId),
}

impl HotPlugEvent {
    /// Id of the camera the event refers to
    pub fn camera_id(&self) -> &CameraId {
        match self {
            HotPlugEvent::Detected(device) => device.id(),
            HotPlugEvent::Missing(id)
            | HotPlugEvent::Reachable(id)
            | HotPlugEvent::Unreachable(id)
            | HotPlugEvent::Unknown(id) => id,
        }
    }
}

impl fmt::Debug for HotPlugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            HotPlugEvent::Detected(_) => "Detected",
            HotPlugEvent::Missing(_) => "Missing",
            HotPlugEvent::Reachable(_) => "Reachable",
            HotPlugEvent::Unreachable(_) => "Unreachable",
            HotPlugEvent::Unknown(_) => "Unknown",
        };
        write!(f, "{}({})", kind, self.camera_id())
    }
}

/// Hot-plug callback installed with [`CameraSystem::subscribe`]
pub type HotPlugCallback = Arc<dyn Fn(HotPlugEvent) + Send + Sync>;

/// Device-management session (camera enumeration and hot-plug events)
pub trait CameraSystem: Send {
    /// Enter the vendor context
    fn enter(&mut self) -> Result<(), CameraError>;

    /// Leave the vendor context
    fn exit(&mut self);

    /// Cameras present right now
    fn cameras(&mut self) -> Result<Vec<Box<dyn CameraDevice>>, CameraError>;

    /// Receive future hot-plug events
    fn subscribe(&mut self, callback: HotPlugCallback) -> Result<(), CameraError>;

    /// Stop receiving hot-plug events. No callback runs after this returns.
    fn unsubscribe(&mut self);
}
