//! Live preview frame handler
//!
//! Pixel drawing belongs to an external [`RenderSurface`]; the display only
//! owns its running state, scales frames to the preview size and maps a
//! user closing the surface to a stop.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camera_capture::{
    Frame, FrameHandler, HandlerError, HandlerEvent, HandlerKind, HandlerNotifier, PixelFormat,
};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info};

/// Default preview size
pub const DEFAULT_DISPLAY_SIZE: (u32, u32) = (640, 480);

/// Bounded wait for start/stop transitions
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Rendering surface owned by the GUI layer
pub trait RenderSurface: Send + Sync {
    fn show(&self) -> Result<(), HandlerError>;

    fn close(&self);

    fn is_visible(&self) -> bool;

    /// Draw one frame already scaled to the display size
    fn present(&self, frame: &Frame) -> Result<(), HandlerError>;
}

/// Frame handler feeding a preview surface
pub struct FrameDisplay {
    name: String,
    surface: Arc<dyn RenderSurface>,
    display_size: (u32, u32),
    lock_timeout: Duration,
    active: AtomicBool,
    transition: Mutex<()>,
    notifier: HandlerNotifier,
}

impl FrameDisplay {
    pub fn new(name: impl Into<String>, surface: Arc<dyn RenderSurface>) -> Self {
        Self::with_size(name, surface, DEFAULT_DISPLAY_SIZE)
    }

    pub fn with_size(
        name: impl Into<String>,
        surface: Arc<dyn RenderSurface>,
        display_size: (u32, u32),
    ) -> Self {
        Self {
            name: name.into(),
            surface,
            display_size,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            active: AtomicBool::new(false),
            transition: Mutex::new(()),
            notifier: HandlerNotifier::new(),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn display_size(&self) -> (u32, u32) {
        self.display_size
    }

    /// The user closed the surface
    pub fn on_surface_closed(&self) {
        info!("Display {}: surface closed", self.name);
        if let Err(e) = self.deactivate(false) {
            error!("Display {}: {}", self.name, e);
        }
    }

    fn lock_transition(&self) -> Result<MutexGuard<'_, ()>, HandlerError> {
        self.transition.try_lock_for(self.lock_timeout).ok_or_else(|| {
            error!("Display {}: timed out waiting for start/stop", self.name);
            HandlerError::LockTimeout("display transition")
        })
    }

    fn deactivate(&self, close_surface: bool) -> Result<(), HandlerError> {
        {
            let _transition = self.lock_transition()?;
            if !self.active.swap(false, Ordering::SeqCst) {
                debug!("Display {} is not running", self.name);
                return Ok(());
            }
            if close_surface {
                self.surface.close();
            }
        }
        self.notifier.notify(HandlerEvent::Stopped);
        Ok(())
    }

    // Dark "waiting for frames" placeholder
    fn placeholder(&self) -> Frame {
        let (width, height) = self.display_size;
        Frame::blank(width, height, PixelFormat::Mono8)
    }

    fn fit<'a>(&self, frame: &'a Frame) -> Result<Cow<'a, Frame>, HandlerError> {
        let (width, height) = self.display_size;
        if frame.size() == self.display_size {
            return Ok(Cow::Borrowed(frame));
        }

        let data = frame.data().to_vec();
        let scaled = match frame.format() {
            PixelFormat::Mono8 => {
                let image = GrayImage::from_raw(frame.width(), frame.height(), data)
                    .ok_or_else(|| HandlerError::Surface("malformed mono frame".to_string()))?;
                imageops::resize(&image, width, height, FilterType::Triangle).into_raw()
            }
            // Channel order is irrelevant to scaling
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => {
                let image = RgbImage::from_raw(frame.width(), frame.height(), data)
                    .ok_or_else(|| HandlerError::Surface("malformed color frame".to_string()))?;
                imageops::resize(&image, width, height, FilterType::Triangle).into_raw()
            }
        };

        Frame::new(scaled, width, height, frame.format())
            .map(|scaled| Cow::Owned(scaled.with_timing(frame.timestamp_ns(), frame.sequence())))
            .map_err(|e| HandlerError::Surface(e.to_string()))
    }
}

impl FrameHandler for FrameDisplay {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Display
    }

    fn start(&self) -> Result<(), HandlerError> {
        {
            let _transition = self.lock_transition()?;
            if self.active.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.surface.show()?;
            if let Err(e) = self.surface.present(&self.placeholder()) {
                self.surface.close();
                return Err(e);
            }
            self.active.store(true, Ordering::SeqCst);
        }

        info!("Display {} started", self.name);
        self.notifier.notify(HandlerEvent::Started);
        Ok(())
    }

    fn stop(&self) -> Result<(), HandlerError> {
        self.deactivate(true)
    }

    fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn add_frame(&self, frame: &Frame) -> Result<(), HandlerError> {
        if !self.is_running() {
            return Ok(());
        }
        let scaled = self.fit(frame)?;
        self.surface.present(&scaled)
    }

    fn notifier(&self) -> &HandlerNotifier {
        &self.notifier
    }
}

/// In-memory surface keeping the last presented frame.
/// Used headless and in tests.
#[derive(Default)]
pub struct OffscreenSurface {
    visible: AtomicBool,
    presented: AtomicUsize,
    last: Mutex<Option<Frame>>,
}

impl OffscreenSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames presented since creation, placeholders included
    pub fn presented(&self) -> usize {
        self.presented.load(Ordering::SeqCst)
    }

    pub fn last_frame(&self) -> Option<Frame> {
        self.last.lock().clone()
    }
}

impl RenderSurface for OffscreenSurface {
    fn show(&self) -> Result<(), HandlerError> {
        self.visible.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.visible.store(false, Ordering::SeqCst);
    }

    fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    fn present(&self, frame: &Frame) -> Result<(), HandlerError> {
        if !self.is_visible() {
            return Err(HandlerError::Surface("surface is closed".to_string()));
        }
        *self.last.lock() = Some(frame.clone());
        self.presented.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn display(size: (u32, u32)) -> (FrameDisplay, Arc<OffscreenSurface>) {
        let surface = Arc::new(OffscreenSurface::new());
        let display = FrameDisplay::with_size("preview", surface.clone(), size);
        (display, surface)
    }

    fn record_events(display: &FrameDisplay) -> Arc<Mutex<Vec<HandlerEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        display
            .notifier()
            .subscribe(Arc::new(move |event| sink.lock().push(event)));
        events
    }

    #[test]
    fn test_start_shows_placeholder() {
        let (display, surface) = display((8, 6));
        let events = record_events(&display);

        display.start().unwrap();
        display.start().unwrap();

        assert!(display.is_running());
        assert!(surface.is_visible());
        let placeholder = surface.last_frame().unwrap();
        assert_eq!(placeholder.size(), (8, 6));
        assert!(placeholder.data().iter().all(|&v| v == 0));
        assert_eq!(*events.lock(), vec![HandlerEvent::Started]);
    }

    #[test]
    fn test_frames_rescaled_to_display_size() {
        let (display, surface) = display((4, 4));
        display.start().unwrap();

        let frame = Frame::new(vec![200; 8 * 8 * 3], 8, 8, PixelFormat::Rgb8)
            .unwrap()
            .with_timing(99, 7);
        display.add_frame(&frame).unwrap();

        let shown = surface.last_frame().unwrap();
        assert_eq!(shown.size(), (4, 4));
        assert_eq!(shown.format(), PixelFormat::Rgb8);
        assert_eq!(shown.sequence(), 7);
        assert!(shown.data().iter().all(|&v| (199..=201).contains(&v)));
    }

    #[test]
    fn test_add_frame_ignored_when_stopped() {
        let (display, surface) = display((4, 4));
        display.add_frame(&Frame::blank(4, 4, PixelFormat::Mono8)).unwrap();
        assert_eq!(surface.presented(), 0);
    }

    #[test]
    fn test_stop_closes_surface() {
        let (display, surface) = display((4, 4));
        let events = record_events(&display);
        display.start().unwrap();
        display.stop().unwrap();
        display.stop().unwrap();

        assert!(!display.is_running());
        assert!(!surface.is_visible());
        assert_eq!(*events.lock(), vec![HandlerEvent::Started, HandlerEvent::Stopped]);
    }

    #[test]
    fn test_surface_close_maps_to_stop() {
        let (display, surface) = display((4, 4));
        let events = record_events(&display);
        display.start().unwrap();

        surface.close();
        display.on_surface_closed();

        assert!(!display.is_running());
        assert_eq!(events.lock().last(), Some(&HandlerEvent::Stopped));
    }

    /// Surface that opens but rejects every frame
    #[derive(Default)]
    struct RejectingSurface {
        visible: AtomicBool,
    }

    impl RenderSurface for RejectingSurface {
        fn show(&self) -> Result<(), HandlerError> {
            self.visible.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {
            self.visible.store(false, Ordering::SeqCst);
        }

        fn is_visible(&self) -> bool {
            self.visible.load(Ordering::SeqCst)
        }

        fn present(&self, _frame: &Frame) -> Result<(), HandlerError> {
            Err(HandlerError::Surface("device lost".to_string()))
        }
    }

    #[test]
    fn test_failed_placeholder_closes_surface() {
        let surface = Arc::new(RejectingSurface::default());
        let display = FrameDisplay::with_size("preview", surface.clone(), (4, 4));
        let events = record_events(&display);

        assert!(matches!(display.start(), Err(HandlerError::Surface(_))));
        assert!(!display.is_running());
        assert!(!surface.is_visible());
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_start_times_out_on_busy_transition() {
        let (display, surface) = display((4, 4));
        let display = display.with_lock_timeout(Duration::from_millis(10));

        let _held = display.transition.lock();
        assert!(matches!(display.start(), Err(HandlerError::LockTimeout(_))));
        assert!(!surface.is_visible());
    }
}
