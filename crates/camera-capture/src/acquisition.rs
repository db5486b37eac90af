//! Per-camera acquisition
//!
//! A [`CameraHandler`] owns one camera session and one acquisition thread.
//! Data flow:
//!
//! ```text
//! driver callback --copy--> FrameQueue --newest--> registered FrameHandlers
//! ```
//!
//! The driver callback never blocks: it deep-copies the frame, pushes it into
//! a bounded queue (displacing the oldest entry when full) and returns, which
//! hands the buffer back to the driver. The acquisition thread takes the
//! newest queued frame and delivers it to every registered handler in
//! registration order.
//!
//! Streaming is demand driven. Each registered handler's `Started`/`Stopped`
//! notifications recompute "any handler running"; the acquisition thread
//! starts or stops hardware streaming to match.

use frame_queue::{FrameQueue, QueueStats};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::frame::{Frame, PixelFormat};
use crate::handler::{FrameHandler, HandlerEvent, HandlerListener, ListenerId};
use crate::sdk::{CameraDevice, DriverFrame, FrameCallback, FrameStatus};
use crate::worker::{StopSignal, Worker};
use crate::{CameraError, CameraId};

/// Acquisition configuration
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Frame queue depth
    pub queue_capacity: usize,
    /// Bounded wait for the handler-set lock
    pub lock_timeout: Duration,
    /// How long one loop iteration waits for a frame
    pub poll_interval: Duration,
    /// Convert frames to this format inside the driver callback
    pub convert_to: Option<PixelFormat>,
    /// Settings file applied when the session opens
    pub settings_file: Option<PathBuf>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: frame_queue::DEFAULT_CAPACITY,
            lock_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(20),
            convert_to: None,
            settings_file: None,
        }
    }
}

/// Acquisition thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// Thread not started yet
    Idle,
    /// Session open, hardware streaming
    Streaming,
    /// Session open, no handler wants frames
    Paused,
    /// Thread finished (quit or setup failure)
    Stopped,
}

/// Acquisition counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    /// Complete frames copied out of the driver
    pub frames_received: u64,
    /// Driver frames discarded in the callback (incomplete or malformed)
    pub frames_rejected: u64,
    /// Frames taken from the queue and dispatched
    pub frames_delivered: u64,
    /// Handler `add_frame` calls that failed or panicked
    pub handler_failures: u64,
    pub queue: QueueStats,
}

struct Registration {
    handler: Arc<dyn FrameHandler>,
    listener: ListenerId,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
}

struct Shared {
    id: CameraId,
    config: AcquisitionConfig,
    registrations: Mutex<Vec<Registration>>,
    // Written only while `registrations` is locked
    should_stream: AtomicBool,
    queue: FrameQueue<Frame>,
    pending_settings: Mutex<Option<PathBuf>>,
    state: Mutex<AcquisitionState>,
    counters: Counters,
}

impl Shared {
    fn set_state(&self, state: AcquisitionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Camera {}: {:?} -> {:?}", self.id, *current, state);
            *current = state;
        }
    }

    fn listener(self: &Arc<Self>) -> HandlerListener {
        let shared = Arc::downgrade(self);
        Arc::new(move |event| {
            if let Some(shared) = shared.upgrade() {
                shared.on_handler_event(event);
            }
        })
    }

    fn on_handler_event(&self, event: HandlerEvent) {
        let Some(registrations) = self.registrations.try_lock_for(self.config.lock_timeout) else {
            error!(
                "Camera {}: timed out locking handlers for {:?} notification",
                self.id, event
            );
            return;
        };
        debug!("Camera {}: handler {:?}", self.id, event);
        self.refresh_demand(&registrations);
    }

    // Caller holds the registration lock
    fn refresh_demand(&self, registrations: &[Registration]) -> bool {
        let demand = registrations.iter().any(|r| r.handler.is_running());
        let previous = self.should_stream.swap(demand, Ordering::SeqCst);
        if demand != previous {
            if demand {
                info!("Camera {}: streaming requested", self.id);
            } else {
                info!("Camera {}: no running handlers, stopping stream", self.id);
            }
        }
        demand
    }

    fn frame_callback(self: &Arc<Self>) -> FrameCallback {
        let shared = self.clone();
        Arc::new(move |frame: &DriverFrame<'_>| shared.on_driver_frame(frame))
    }

    // Driver thread: copy, enqueue, return
    fn on_driver_frame(&self, driver_frame: &DriverFrame<'_>) {
        if driver_frame.status != FrameStatus::Complete {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Camera {}: discarding {:?} frame {}",
                self.id, driver_frame.status, driver_frame.sequence
            );
            return;
        }

        match Frame::copy_from(driver_frame) {
            Ok(frame) => {
                let frame = match self.config.convert_to {
                    Some(format) if format != frame.format() => frame.convert(format),
                    _ => frame,
                };
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                self.queue.push(frame);
            }
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Camera {}: unusable frame: {}", self.id, e);
            }
        }
    }

    // Acquisition thread: deliver one frame to a snapshot of the handler set
    fn dispatch(&self, frame: &Frame) {
        let handlers: Vec<Arc<dyn FrameHandler>> =
            match self.registrations.try_lock_for(self.config.lock_timeout) {
                Some(registrations) => registrations.iter().map(|r| r.handler.clone()).collect(),
                None => {
                    error!(
                        "Camera {}: timed out locking handlers, frame {} abandoned",
                        self.id,
                        frame.sequence()
                    );
                    return;
                }
            };

        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler.add_frame(frame))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Camera {}: handler {} failed on frame {}: {}",
                        self.id,
                        handler.name(),
                        frame.sequence(),
                        e
                    );
                }
                Err(_) => {
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Camera {}: handler {} panicked on frame {}",
                        self.id,
                        handler.name(),
                        frame.sequence()
                    );
                }
            }
        }
    }
}

/// The body of a camera's acquisition thread
struct AcquisitionLoop {
    device: Box<dyn CameraDevice>,
    shared: Arc<Shared>,
    start_failures: u32,
}

impl AcquisitionLoop {
    fn new(device: Box<dyn CameraDevice>, shared: Arc<Shared>) -> Self {
        Self {
            device,
            shared,
            start_failures: 0,
        }
    }

    fn run(mut self, stop: StopSignal) {
        let id = self.shared.id.clone();
        info!("Acquisition thread started for camera {}", id);

        if let Err(e) = self.open() {
            error!("Camera {}: session setup failed: {}", id, e);
            self.shared.set_state(AcquisitionState::Stopped);
            return;
        }

        while !stop.is_set() {
            self.tick();
        }

        self.shutdown();
        info!("Acquisition thread finished for camera {}", id);
    }

    fn open(&mut self) -> Result<(), CameraError> {
        self.device.open()?;
        if let Some(path) = self.shared.config.settings_file.clone() {
            if let Err(e) = self.device.load_settings(&path) {
                self.device.close();
                return Err(e);
            }
            info!(
                "Camera {}: loaded settings from {}",
                self.shared.id,
                path.display()
            );
        }
        self.shared.set_state(AcquisitionState::Paused);
        Ok(())
    }

    /// One loop iteration: apply settings, match streaming to demand, then
    /// wait up to one poll interval for a frame and dispatch it.
    fn tick(&mut self) {
        self.apply_pending_settings();
        self.sync_streaming();

        if let Some(frame) = self
            .shared
            .queue
            .pop_newest_timeout(self.shared.config.poll_interval)
        {
            self.shared.dispatch(&frame);
        }
    }

    fn apply_pending_settings(&mut self) {
        let Some(path) = self.shared.pending_settings.lock().take() else {
            return;
        };

        // Settings can only be applied to an idle session; demand restarts
        // streaming on the same tick
        if self.device.is_streaming() {
            self.stop_streaming();
        }
        match self.device.load_settings(&path) {
            Ok(()) => info!(
                "Camera {}: loaded settings from {}",
                self.shared.id,
                path.display()
            ),
            Err(e) => error!("Camera {}: {}", self.shared.id, e),
        }
    }

    fn sync_streaming(&mut self) {
        let wanted = self.shared.should_stream.load(Ordering::SeqCst);
        let streaming = self.device.is_streaming();

        if wanted && !streaming {
            match self.device.start_streaming(self.shared.frame_callback()) {
                Ok(()) => {
                    self.start_failures = 0;
                    self.shared.set_state(AcquisitionState::Streaming);
                    info!("Camera {}: streaming started", self.shared.id);
                }
                Err(e) => {
                    self.start_failures += 1;
                    if self.start_failures == 1 {
                        error!("Camera {}: failed to start streaming: {}", self.shared.id, e);
                    } else {
                        debug!(
                            "Camera {}: start attempt {} failed: {}",
                            self.shared.id, self.start_failures, e
                        );
                    }
                }
            }
        } else if !wanted && streaming {
            self.stop_streaming();
        }
    }

    fn stop_streaming(&mut self) {
        if let Err(e) = self.device.stop_streaming() {
            error!("Camera {}: failed to stop streaming: {}", self.shared.id, e);
        }
        let stale = self.shared.queue.clear();
        self.shared.set_state(AcquisitionState::Paused);
        info!(
            "Camera {}: streaming stopped ({} queued frames discarded)",
            self.shared.id, stale
        );
    }

    fn shutdown(&mut self) {
        if self.device.is_streaming() {
            self.stop_streaming();
        }
        self.shared.queue.clear();
        self.device.close();
    }
}

/// One camera: its session, frame queue, handler set and acquisition thread
pub struct CameraHandler {
    shared: Arc<Shared>,
    // Session waiting for `start`
    device: Mutex<Option<Box<dyn CameraDevice>>>,
    worker: Mutex<Option<Worker<()>>>,
    quit: AtomicBool,
}

impl CameraHandler {
    /// Wrap a camera session. The acquisition thread starts with
    /// [`CameraHandler::start`].
    pub fn new(device: Box<dyn CameraDevice>, config: AcquisitionConfig) -> Result<Self, CameraError> {
        let id = device.id().clone();
        let queue = FrameQueue::new(id.to_string(), config.queue_capacity)
            .map_err(|e| CameraError::Config(format!("camera {}: {}", id, e)))?;

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                config,
                registrations: Mutex::new(Vec::new()),
                should_stream: AtomicBool::new(false),
                queue,
                pending_settings: Mutex::new(None),
                state: Mutex::new(AcquisitionState::Idle),
                counters: Counters::default(),
            }),
            device: Mutex::new(Some(device)),
            worker: Mutex::new(None),
            quit: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &CameraId {
        &self.shared.id
    }

    /// Spawn the acquisition thread. A no-op once started.
    pub fn start(&self) -> Result<(), CameraError> {
        if self.quit.load(Ordering::SeqCst) {
            return Err(CameraError::Terminated(self.shared.id.clone()));
        }
        let Some(device) = self.device.lock().take() else {
            debug!("Camera {}: acquisition already started", self.shared.id);
            return Ok(());
        };

        let acquisition = AcquisitionLoop::new(device, self.shared.clone());
        let worker = Worker::spawn(format!("camera-{}", self.shared.id), move |stop| {
            acquisition.run(stop)
        })?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    /// Register a frame handler. Registering the same handler twice is a
    /// no-op.
    pub fn register_frame_handler(&self, handler: Arc<dyn FrameHandler>) -> Result<(), CameraError> {
        let mut registrations = self.lock_registrations("handler registration")?;

        if registrations.iter().any(|r| Arc::ptr_eq(&r.handler, &handler)) {
            warn!(
                "Camera {}: handler {} is already registered",
                self.shared.id,
                handler.name()
            );
            return Ok(());
        }

        let listener = handler.notifier().subscribe(self.shared.listener());
        info!("Camera {}: registered handler {}", self.shared.id, handler.name());
        registrations.push(Registration { handler, listener });
        self.shared.refresh_demand(&registrations);
        Ok(())
    }

    /// Stop and unregister a frame handler
    pub fn unregister_frame_handler(&self, handler: &dyn FrameHandler) -> Result<(), CameraError> {
        let registration = {
            let mut registrations = self.lock_registrations("handler removal")?;
            let Some(position) = registrations
                .iter()
                .position(|r| std::ptr::addr_eq(Arc::as_ptr(&r.handler), handler))
            else {
                error!(
                    "Camera {}: handler {} is not registered",
                    self.shared.id,
                    handler.name()
                );
                return Err(CameraError::UnknownHandler(handler.name().to_string()));
            };

            let registration = registrations.remove(position);
            registration.handler.notifier().unsubscribe(registration.listener);
            self.shared.refresh_demand(&registrations);
            registration
        };

        if let Err(e) = registration.handler.stop() {
            warn!(
                "Camera {}: handler {} failed to stop: {}",
                self.shared.id,
                registration.handler.name(),
                e
            );
        }
        info!(
            "Camera {}: unregistered handler {}",
            self.shared.id,
            registration.handler.name()
        );
        Ok(())
    }

    /// True iff at least one registered handler is running
    pub fn should_stream(&self) -> bool {
        self.shared.should_stream.load(Ordering::SeqCst)
    }

    /// Apply a settings file. Streaming pauses while it loads.
    pub fn set_config_file(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        info!(
            "Camera {}: settings file {} queued",
            self.shared.id,
            path.display()
        );
        *self.shared.pending_settings.lock() = Some(path);
    }

    pub fn state(&self) -> AcquisitionState {
        *self.shared.state.lock()
    }

    pub fn stats(&self) -> AcquisitionStats {
        let counters = &self.shared.counters;
        AcquisitionStats {
            frames_received: counters.received.load(Ordering::Relaxed),
            frames_rejected: counters.rejected.load(Ordering::Relaxed),
            frames_delivered: counters.delivered.load(Ordering::Relaxed),
            handler_failures: counters.handler_failures.load(Ordering::Relaxed),
            queue: self.shared.queue.stats(),
        }
    }

    /// Names of the registered handlers, in registration order
    pub fn handler_names(&self) -> Vec<String> {
        match self.shared.registrations.try_lock_for(self.shared.config.lock_timeout) {
            Some(registrations) => registrations
                .iter()
                .map(|r| r.handler.name().to_string())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handler_names().len()
    }

    /// Stop the acquisition thread, close the session and stop every
    /// registered handler. Blocks until the thread has exited. Idempotent.
    pub fn quit(&self) {
        if self.quit.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Waiting for acquisition thread of camera {} to stop", self.shared.id);
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop_and_join();
        }
        // Never started: just drop the session
        self.device.lock().take();
        self.shared.queue.clear();

        let registrations = match self.shared.registrations.try_lock_for(self.shared.config.lock_timeout) {
            Some(mut registrations) => {
                self.shared.should_stream.store(false, Ordering::SeqCst);
                std::mem::take(&mut *registrations)
            }
            None => {
                error!(
                    "Camera {}: timed out locking handlers during shutdown",
                    self.shared.id
                );
                Vec::new()
            }
        };

        for registration in registrations {
            registration.handler.notifier().unsubscribe(registration.listener);
            if registration.handler.is_running() {
                if let Err(e) = registration.handler.stop() {
                    warn!(
                        "Camera {}: handler {} failed to stop: {}",
                        self.shared.id,
                        registration.handler.name(),
                        e
                    );
                }
            }
        }

        self.shared.set_state(AcquisitionState::Stopped);
        info!("Camera {} stopped", self.shared.id);
    }

    fn lock_registrations(
        &self,
        operation: &'static str,
    ) -> Result<parking_lot::MutexGuard<'_, Vec<Registration>>, CameraError> {
        self.shared
            .registrations
            .try_lock_for(self.shared.config.lock_timeout)
            .ok_or_else(|| {
                error!("Camera {}: timed out locking handlers for {}", self.shared.id, operation);
                CameraError::LockTimeout(operation)
            })
    }
}

impl Drop for CameraHandler {
    fn drop(&mut self) {
        self.quit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCamera, SimCameraProbe};
    use crate::testing::{Behavior, TestHandler};
    use proptest::prelude::*;
    use std::time::Instant;

    fn camera(config: AcquisitionConfig) -> (CameraHandler, SimCameraProbe) {
        let (device, probe) = SimCamera::manual("cam1", 4, 4, PixelFormat::Mono8);
        (CameraHandler::new(Box::new(device), config).unwrap(), probe)
    }

    fn fast_config() -> AcquisitionConfig {
        AcquisitionConfig {
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    // Drive the loop on the test thread instead of a worker
    fn manual_loop(camera: &CameraHandler) -> AcquisitionLoop {
        let device = camera.device.lock().take().unwrap();
        let mut acquisition = AcquisitionLoop::new(device, camera.shared.clone());
        acquisition.open().unwrap();
        acquisition
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_demand_follows_handler_lifecycle() {
        let (camera, _probe) = camera(fast_config());
        let display = TestHandler::new("display");
        let writer = TestHandler::new("writer");
        camera.register_frame_handler(display.clone()).unwrap();
        camera.register_frame_handler(writer.clone()).unwrap();
        assert!(!camera.should_stream());

        display.start().unwrap();
        assert!(camera.should_stream());
        writer.start().unwrap();
        display.stop().unwrap();
        assert!(camera.should_stream());
        writer.stop().unwrap();
        assert!(!camera.should_stream());
    }

    #[test]
    fn test_registering_running_handler_requests_streaming() {
        let (camera, _probe) = camera(fast_config());
        let handler = TestHandler::new("display");
        handler.start().unwrap();

        camera.register_frame_handler(handler).unwrap();
        assert!(camera.should_stream());
    }

    #[test]
    fn test_duplicate_registration_is_ignored() {
        let (camera, _probe) = camera(fast_config());
        let handler = TestHandler::new("display");
        camera.register_frame_handler(handler.clone()).unwrap();
        camera.register_frame_handler(handler.clone()).unwrap();

        assert_eq!(camera.handler_count(), 1);
        assert_eq!(handler.notifier().listener_count(), 1);
    }

    #[test]
    fn test_unregister_unknown_handler_fails() {
        let (camera, _probe) = camera(fast_config());
        let registered = TestHandler::new("display");
        let stranger = TestHandler::new("stranger");
        camera.register_frame_handler(registered).unwrap();

        assert!(matches!(
            camera.unregister_frame_handler(stranger.as_ref()),
            Err(CameraError::UnknownHandler(_))
        ));
        assert_eq!(camera.handler_names(), vec!["display".to_string()]);
    }

    #[test]
    fn test_unregister_stops_handler_and_drops_demand() {
        let (camera, _probe) = camera(fast_config());
        let handler = TestHandler::new("writer");
        camera.register_frame_handler(handler.clone()).unwrap();
        handler.start().unwrap();
        assert!(camera.should_stream());

        camera.unregister_frame_handler(handler.as_ref()).unwrap();
        assert!(!handler.is_running());
        assert!(!camera.should_stream());
        assert_eq!(handler.notifier().listener_count(), 0);
        assert_eq!(camera.handler_count(), 0);
    }

    #[test]
    fn test_registration_times_out_when_lock_is_held() {
        let (camera, _probe) = camera(AcquisitionConfig {
            lock_timeout: Duration::from_millis(20),
            ..fast_config()
        });
        let _held = camera.shared.registrations.lock();

        let result = camera.register_frame_handler(TestHandler::new("display"));
        assert!(matches!(result, Err(CameraError::LockTimeout(_))));
    }

    #[test]
    fn test_tick_follows_demand() {
        let (camera, probe) = camera(fast_config());
        let handler = TestHandler::new("display");
        camera.register_frame_handler(handler.clone()).unwrap();
        let mut acquisition = manual_loop(&camera);

        acquisition.tick();
        assert!(!probe.is_streaming());
        assert_eq!(camera.state(), AcquisitionState::Paused);

        handler.start().unwrap();
        acquisition.tick();
        assert!(probe.is_streaming());
        assert_eq!(camera.state(), AcquisitionState::Streaming);

        probe.emit_frame();
        acquisition.tick();
        assert_eq!(handler.sequences(), vec![1]);

        handler.stop().unwrap();
        acquisition.tick();
        assert!(!probe.is_streaming());
        assert_eq!(probe.stream_stops(), 1);
    }

    #[test]
    fn test_newest_frame_wins() {
        let (camera, probe) = camera(AcquisitionConfig {
            queue_capacity: 4,
            ..fast_config()
        });
        let handler = TestHandler::new("display");
        camera.register_frame_handler(handler.clone()).unwrap();
        handler.start().unwrap();
        let mut acquisition = manual_loop(&camera);
        acquisition.tick();

        for _ in 0..3 {
            probe.emit_frame();
        }
        acquisition.tick();
        acquisition.tick();

        assert_eq!(handler.sequences(), vec![3]);
        assert_eq!(camera.stats().queue.dropped, 2);
        assert_eq!(probe.buffers_returned(), 3);
    }

    #[test]
    fn test_failing_handlers_do_not_block_others() {
        let (camera, probe) = camera(fast_config());
        let failing = TestHandler::with_behavior("failing", Behavior::Fail);
        let panicking = TestHandler::with_behavior("panicking", Behavior::Panic);
        let healthy = TestHandler::new("healthy");
        for handler in [&failing, &panicking, &healthy] {
            camera.register_frame_handler(handler.clone()).unwrap();
            handler.start().unwrap();
        }
        let mut acquisition = manual_loop(&camera);
        acquisition.tick();

        probe.emit_frame();
        acquisition.tick();
        probe.emit_frame();
        acquisition.tick();

        assert_eq!(healthy.sequences(), vec![1, 2]);
        let stats = camera.stats();
        assert_eq!(stats.frames_delivered, 2);
        assert_eq!(stats.handler_failures, 4);
    }

    #[test]
    fn test_incomplete_frames_are_rejected() {
        let (camera, probe) = camera(fast_config());
        let handler = TestHandler::new("display");
        camera.register_frame_handler(handler.clone()).unwrap();
        handler.start().unwrap();
        let mut acquisition = manual_loop(&camera);
        acquisition.tick();

        probe.emit_frame_with_status(FrameStatus::Incomplete);
        acquisition.tick();

        assert_eq!(handler.frame_count(), 0);
        assert_eq!(camera.stats().frames_rejected, 1);
        assert_eq!(probe.buffers_returned(), 1);
    }

    #[test]
    fn test_frames_converted_in_callback() {
        let (camera, probe) = camera(AcquisitionConfig {
            convert_to: Some(PixelFormat::Rgb8),
            ..fast_config()
        });
        let handler = TestHandler::new("display");
        camera.register_frame_handler(handler.clone()).unwrap();
        handler.start().unwrap();
        let mut acquisition = manual_loop(&camera);
        acquisition.tick();

        probe.emit_frame();
        let frame = camera.shared.queue.pop_newest().unwrap();
        assert_eq!(frame.format(), PixelFormat::Rgb8);
        assert_eq!(frame.data().len(), 4 * 4 * 3);
    }

    #[test]
    fn test_settings_applied_with_stream_restart() {
        let (camera, probe) = camera(fast_config());
        let handler = TestHandler::new("writer");
        camera.register_frame_handler(handler.clone()).unwrap();
        handler.start().unwrap();
        let mut acquisition = manual_loop(&camera);
        acquisition.tick();
        assert_eq!(probe.stream_starts(), 1);

        camera.set_config_file("exposure.xml");
        acquisition.tick();

        assert_eq!(probe.loaded_settings(), vec![PathBuf::from("exposure.xml")]);
        assert_eq!(probe.stream_stops(), 1);
        assert_eq!(probe.stream_starts(), 2);
        assert!(probe.is_streaming());
    }

    #[test]
    fn test_settings_failure_keeps_running() {
        let (camera, probe) = camera(fast_config());
        let mut acquisition = manual_loop(&camera);
        probe.set_fail_settings(true);

        camera.set_config_file("broken.xml");
        acquisition.tick();
        assert!(probe.loaded_settings().is_empty());
        assert_eq!(camera.state(), AcquisitionState::Paused);
    }

    #[test]
    fn test_threaded_acquisition_and_quit() {
        let (camera, probe) = camera(fast_config());
        let handler = TestHandler::new("display");
        camera.register_frame_handler(handler.clone()).unwrap();
        camera.start().unwrap();
        camera.start().unwrap();

        handler.start().unwrap();
        assert!(wait_until(|| probe.is_streaming()));
        probe.emit_frame();
        assert!(wait_until(|| handler.frame_count() == 1));

        camera.quit();
        assert!(!probe.is_streaming());
        assert!(!probe.is_open());
        assert!(!handler.is_running());
        assert_eq!(camera.state(), AcquisitionState::Stopped);
        assert_eq!(camera.handler_count(), 0);
        assert!(matches!(camera.start(), Err(CameraError::Terminated(_))));

        // Idempotent
        camera.quit();
        assert_eq!(handler.stop_calls(), 1);
    }

    #[test]
    fn test_open_failure_stops_thread() {
        let (camera, probe) = camera(fast_config());
        probe.set_fail_open(true);
        camera.start().unwrap();

        assert!(wait_until(|| camera.state() == AcquisitionState::Stopped));
        assert!(!probe.is_open());
    }

    #[test]
    fn test_initial_settings_failure_closes_session() {
        let (camera, probe) = camera(AcquisitionConfig {
            settings_file: Some(PathBuf::from("missing.xml")),
            ..fast_config()
        });
        probe.set_fail_settings(true);
        camera.start().unwrap();

        assert!(wait_until(|| camera.state() == AcquisitionState::Stopped));
        assert!(!probe.is_open());
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let (device, _probe) = SimCamera::manual("cam1", 2, 2, PixelFormat::Mono8);
        let result = CameraHandler::new(
            Box::new(device),
            AcquisitionConfig {
                queue_capacity: 0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(CameraError::Config(_))));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(usize),
        Unregister(usize),
        Start(usize),
        Stop(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4usize).prop_map(Op::Register),
            (0..4usize).prop_map(Op::Unregister),
            (0..4usize).prop_map(Op::Start),
            (0..4usize).prop_map(Op::Stop),
        ]
    }

    proptest! {
        #[test]
        fn prop_should_stream_iff_any_registered_handler_runs(ops in prop::collection::vec(op(), 1..40)) {
            let (camera, _probe) = camera(fast_config());
            let handlers: Vec<Arc<TestHandler>> =
                (0..4).map(|i| TestHandler::new(&format!("h{}", i))).collect();
            let mut registered = [false; 4];

            for op in ops {
                match op {
                    Op::Register(i) => {
                        camera.register_frame_handler(handlers[i].clone()).unwrap();
                        registered[i] = true;
                    }
                    Op::Unregister(i) => {
                        let result = camera.unregister_frame_handler(handlers[i].as_ref());
                        prop_assert_eq!(result.is_ok(), registered[i]);
                        registered[i] = false;
                    }
                    Op::Start(i) => handlers[i].start().unwrap(),
                    Op::Stop(i) => handlers[i].stop().unwrap(),
                }

                let expected = (0..4).any(|i| registered[i] && handlers[i].is_running());
                prop_assert_eq!(camera.should_stream(), expected);
            }
        }
    }
}
