//! Frame handler contract
//!
//! A frame handler is a pluggable frame consumer (preview display, video
//! writer, ...). Handlers announce demand through `Started`/`Stopped`
//! notifications; a [`crate::CameraHandler`] listens to them to decide whether
//! the camera should be streaming.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::frame::Frame;

/// Frame handler errors
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Delivered frame does not match the handler's configured size
    #[error("Frame size mismatch: expected {expected:?}, got {actual:?}")]
    FrameSizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Timed out waiting for lock: {0}")]
    LockTimeout(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Render surface error: {0}")]
    Surface(String),

    #[error("Too many consecutive write failures ({0})")]
    WriteFailures(u32),
}

/// Lifecycle notification emitted by a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerEvent {
    Started,
    Stopped,
}

/// Concrete handler variety, used when grouping handlers per camera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Display,
    Writer,
    Custom,
}

/// Listener subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Lifecycle listener
pub type HandlerListener = Arc<dyn Fn(HandlerEvent) + Send + Sync>;

/// Synchronous observer list for handler lifecycle events
///
/// Listeners run on the thread that emitted the event, before the emitting
/// call returns. The listener list lock is never held while a listener runs,
/// so listeners may subscribe or unsubscribe.
#[derive(Default)]
pub struct HandlerNotifier {
    listeners: Mutex<Vec<(ListenerId, HandlerListener)>>,
    next_id: AtomicU64,
}

impl HandlerNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn subscribe(&self, listener: HandlerListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Deliver `event` to every listener
    pub fn notify(&self, event: HandlerEvent) {
        let listeners: Vec<HandlerListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        debug!("Notifying {} listeners: {:?}", listeners.len(), event);
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Frame consumer contract
///
/// Implementations use interior mutability: a handler is shared between the
/// application (which starts and stops it) and the acquisition thread (which
/// delivers frames).
pub trait FrameHandler: Send + Sync {
    /// Human-readable handler name
    fn name(&self) -> &str;

    fn kind(&self) -> HandlerKind {
        HandlerKind::Custom
    }

    /// Begin consuming frames. Idempotent; emits `Started` on transition.
    fn start(&self) -> Result<(), HandlerError>;

    /// Stop consuming frames. Idempotent; emits `Stopped` on transition,
    /// including stops triggered by internal failures.
    fn stop(&self) -> Result<(), HandlerError>;

    /// Point-in-time running state. Must not block on handler I/O.
    fn is_running(&self) -> bool;

    /// Deliver one frame. A no-op when the handler is not running.
    fn add_frame(&self, frame: &Frame) -> Result<(), HandlerError>;

    /// Lifecycle notifications for this handler
    fn notifier(&self) -> &HandlerNotifier;
}
