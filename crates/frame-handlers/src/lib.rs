//! Frame Handlers
//!
//! Concrete frame consumers for the acquisition core:
//! - [`VideoWriter`]: records frames to a timestamped video file
//! - [`FrameDisplay`]: live preview on an external render surface
//!
//! Both implement [`camera_capture::FrameHandler`] and emit `Started`/`Stopped`
//! notifications on every state transition.

pub mod display;
pub mod encoder;
pub mod writer;

pub use display::{FrameDisplay, OffscreenSurface, RenderSurface, DEFAULT_DISPLAY_SIZE};
pub use encoder::{
    ColorMode, EncoderBackend, EncoderParams, FfmpegBackend, FrameEncoder, Y4mBackend,
};
pub use writer::{VideoWriter, VideoWriterConfig, WriterState};
