//! Simulated camera SDK
//!
//! [`SimCamera`] and [`SimCameraSystem`] implement the [`crate::sdk`] traits
//! without hardware. Cameras either free-run at a fixed frame rate on their
//! own driver thread, or stay manual so a caller triggers every frame through
//! [`SimCameraProbe::emit_frame`]. Hot-plug is driven through
//! [`SimSystemHandle::attach`] / [`SimSystemHandle::detach`].
//!
//! ```rust
//! use camera_capture::sim::{SimCamera, SimCameraSystem};
//! use camera_capture::PixelFormat;
//!
//! let (camera, probe) = SimCamera::manual("cam1", 4, 4, PixelFormat::Mono8);
//! let system = SimCameraSystem::with_cameras(vec![camera]);
//! let handle = system.handle();
//! assert_eq!(handle.present_ids().len(), 1);
//! assert!(!probe.is_streaming());
//! ```

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::frame::PixelFormat;
use crate::sdk::{
    CameraDevice, CameraSystem, DriverFrame, FrameCallback, FrameStatus, HotPlugCallback,
    HotPlugEvent,
};
use crate::worker::Worker;
use crate::{CameraError, CameraId};

/// Number of buffers in a simulated driver ring
const RING_BUFFERS: usize = 3;

struct SimState {
    open: bool,
    callback: Option<FrameCallback>,
    ring: Vec<Vec<u8>>,
    sequence: u64,
    frames_emitted: u64,
    buffers_returned: u64,
    stream_starts: u32,
    stream_stops: u32,
    loaded_settings: Vec<PathBuf>,
    fail_open: bool,
    fail_settings: bool,
    fail_stream: bool,
}

struct SimShared {
    id: CameraId,
    width: u32,
    height: u32,
    format: PixelFormat,
    fps: u32,
    epoch: Instant,
    state: Mutex<SimState>,
    // Held for the whole duration of a callback invocation
    emitting: Mutex<()>,
}

impl SimShared {
    fn emit(&self, status: FrameStatus) -> bool {
        let _emitting = self.emitting.lock();

        let (callback, mut buffer, sequence) = {
            let mut state = self.state.lock();
            let Some(callback) = state.callback.clone() else {
                return false;
            };
            let len = self.format.buffer_len(self.width, self.height);
            let buffer = state.ring.pop().unwrap_or_else(|| vec![0; len]);
            state.sequence += 1;
            (callback, buffer, state.sequence)
        };

        fill_pattern(&mut buffer, sequence);
        let frame = DriverFrame {
            status,
            width: self.width,
            height: self.height,
            format: self.format,
            buffer: &buffer,
            timestamp_ns: self.epoch.elapsed().as_nanos() as u64,
            sequence,
        };
        callback(&frame);

        let mut state = self.state.lock();
        state.ring.push(buffer);
        state.frames_emitted += 1;
        state.buffers_returned += 1;
        true
    }
}

// Moving diagonal gradient, so consecutive frames differ
fn fill_pattern(buffer: &mut [u8], sequence: u64) {
    for (i, byte) in buffer.iter_mut().enumerate() {
        *byte = ((i as u64).wrapping_add(sequence) % 256) as u8;
    }
}

/// Simulated camera session
pub struct SimCamera {
    shared: Arc<SimShared>,
    driver: Option<Worker<()>>,
}

impl SimCamera {
    /// Camera producing `fps` frames per second once streaming.
    /// `fps == 0` gives a manual camera.
    pub fn new(
        id: impl Into<CameraId>,
        width: u32,
        height: u32,
        format: PixelFormat,
        fps: u32,
    ) -> (Self, SimCameraProbe) {
        let len = format.buffer_len(width, height);
        let shared = Arc::new(SimShared {
            id: id.into(),
            width,
            height,
            format,
            fps,
            epoch: Instant::now(),
            state: Mutex::new(SimState {
                open: false,
                callback: None,
                ring: (0..RING_BUFFERS).map(|_| vec![0; len]).collect(),
                sequence: 0,
                frames_emitted: 0,
                buffers_returned: 0,
                stream_starts: 0,
                stream_stops: 0,
                loaded_settings: Vec::new(),
                fail_open: false,
                fail_settings: false,
                fail_stream: false,
            }),
            emitting: Mutex::new(()),
        });

        let probe = SimCameraProbe {
            shared: shared.clone(),
        };
        (
            Self {
                shared,
                driver: None,
            },
            probe,
        )
    }

    /// Camera that only produces frames through [`SimCameraProbe::emit_frame`]
    pub fn manual(
        id: impl Into<CameraId>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> (Self, SimCameraProbe) {
        Self::new(id, width, height, format, 0)
    }

    fn handle(shared: &Arc<SimShared>) -> Self {
        Self {
            shared: shared.clone(),
            driver: None,
        }
    }
}

impl CameraDevice for SimCamera {
    fn id(&self) -> &CameraId {
        &self.shared.id
    }

    fn open(&mut self) -> Result<(), CameraError> {
        let mut state = self.shared.state.lock();
        if state.fail_open {
            return Err(CameraError::Open(format!(
                "simulated camera {} refused the session",
                self.shared.id
            )));
        }
        state.open = true;
        debug!("Sim camera {} opened", self.shared.id);
        Ok(())
    }

    fn close(&mut self) {
        if self.is_streaming() {
            let _ = self.stop_streaming();
        }
        self.shared.state.lock().open = false;
        debug!("Sim camera {} closed", self.shared.id);
    }

    fn start_streaming(&mut self, callback: FrameCallback) -> Result<(), CameraError> {
        {
            let mut state = self.shared.state.lock();
            if !state.open {
                return Err(CameraError::Stream(format!(
                    "camera {} is not open",
                    self.shared.id
                )));
            }
            if state.fail_stream {
                return Err(CameraError::Stream(format!(
                    "simulated camera {} failed to start",
                    self.shared.id
                )));
            }
            if state.callback.is_some() {
                return Ok(());
            }
            state.callback = Some(callback);
            state.stream_starts += 1;
        }

        if self.shared.fps > 0 {
            let shared = self.shared.clone();
            let interval = Duration::from_secs_f64(1.0 / f64::from(shared.fps));
            let worker = Worker::spawn(format!("sim-driver-{}", shared.id), move |stop| {
                while !stop.wait_timeout(interval) {
                    shared.emit(FrameStatus::Complete);
                }
            })?;
            self.driver = Some(worker);
        }

        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), CameraError> {
        if let Some(mut driver) = self.driver.take() {
            driver.stop_and_join();
        }

        let mut state = self.shared.state.lock();
        if state.callback.take().is_some() {
            state.stream_stops += 1;
        }
        drop(state);

        // Wait out a callback still running on another thread
        drop(self.shared.emitting.lock());
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.shared.state.lock().callback.is_some()
    }

    fn load_settings(&mut self, path: &Path) -> Result<(), CameraError> {
        let mut state = self.shared.state.lock();
        if state.callback.is_some() {
            return Err(CameraError::Settings {
                path: path.to_path_buf(),
                reason: "camera is streaming".to_string(),
            });
        }
        if state.fail_settings {
            return Err(CameraError::Settings {
                path: path.to_path_buf(),
                reason: "simulated settings failure".to_string(),
            });
        }
        state.loaded_settings.push(path.to_path_buf());
        Ok(())
    }
}

impl Drop for SimCamera {
    fn drop(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.stop_and_join();
        }
    }
}

/// Test-side view of a simulated camera
#[derive(Clone)]
pub struct SimCameraProbe {
    shared: Arc<SimShared>,
}

impl SimCameraProbe {
    pub fn id(&self) -> &CameraId {
        &self.shared.id
    }

    /// Deliver one complete frame on the calling thread.
    /// Returns false when the camera is not streaming.
    pub fn emit_frame(&self) -> bool {
        self.shared.emit(FrameStatus::Complete)
    }

    /// Deliver one frame carrying `status`
    pub fn emit_frame_with_status(&self, status: FrameStatus) -> bool {
        self.shared.emit(status)
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.state.lock().callback.is_some()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.shared.state.lock().frames_emitted
    }

    /// Buffers handed back to the ring after their callback returned
    pub fn buffers_returned(&self) -> u64 {
        self.shared.state.lock().buffers_returned
    }

    pub fn stream_starts(&self) -> u32 {
        self.shared.state.lock().stream_starts
    }

    pub fn stream_stops(&self) -> u32 {
        self.shared.state.lock().stream_stops
    }

    /// Settings files applied so far, in order
    pub fn loaded_settings(&self) -> Vec<PathBuf> {
        self.shared.state.lock().loaded_settings.clone()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.shared.state.lock().fail_open = fail;
    }

    pub fn set_fail_settings(&self, fail: bool) {
        self.shared.state.lock().fail_settings = fail;
    }

    pub fn set_fail_stream(&self, fail: bool) {
        self.shared.state.lock().fail_stream = fail;
    }
}

#[derive(Default)]
struct SystemState {
    entered: bool,
    fail_enter: bool,
    present: Vec<Arc<SimShared>>,
    callback: Option<HotPlugCallback>,
}

#[derive(Default)]
struct SystemShared {
    state: Mutex<SystemState>,
    // Held for the whole duration of a hot-plug callback
    notifying: Mutex<()>,
}

impl SystemShared {
    fn send(&self, event: HotPlugEvent) -> bool {
        let _notifying = self.notifying.lock();
        let Some(callback) = self.state.lock().callback.clone() else {
            debug!("No hot-plug subscriber, dropping {:?}", event);
            return false;
        };
        callback(event);
        true
    }
}

/// Simulated device-management session
#[derive(Default)]
pub struct SimCameraSystem {
    shared: Arc<SystemShared>,
}

impl SimCameraSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// System with `cameras` already plugged in
    pub fn with_cameras(cameras: Vec<SimCamera>) -> Self {
        let system = Self::new();
        system
            .shared
            .state
            .lock()
            .present
            .extend(cameras.into_iter().map(|camera| camera.shared.clone()));
        system
    }

    /// Handle for driving hot-plug after the system is handed off
    pub fn handle(&self) -> SimSystemHandle {
        SimSystemHandle {
            shared: self.shared.clone(),
        }
    }
}

impl CameraSystem for SimCameraSystem {
    fn enter(&mut self) -> Result<(), CameraError> {
        let mut state = self.shared.state.lock();
        if state.fail_enter {
            return Err(CameraError::System(
                "simulated camera system unavailable".to_string(),
            ));
        }
        state.entered = true;
        info!("Sim camera system entered ({} cameras)", state.present.len());
        Ok(())
    }

    fn exit(&mut self) {
        self.shared.state.lock().entered = false;
        info!("Sim camera system exited");
    }

    fn cameras(&mut self) -> Result<Vec<Box<dyn CameraDevice>>, CameraError> {
        let state = self.shared.state.lock();
        if !state.entered {
            return Err(CameraError::System(
                "camera system not entered".to_string(),
            ));
        }
        Ok(state
            .present
            .iter()
            .map(|shared| Box::new(SimCamera::handle(shared)) as Box<dyn CameraDevice>)
            .collect())
    }

    fn subscribe(&mut self, callback: HotPlugCallback) -> Result<(), CameraError> {
        self.shared.state.lock().callback = Some(callback);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.shared.state.lock().callback = None;
        drop(self.shared.notifying.lock());
    }
}

/// Hot-plug driver for a [`SimCameraSystem`]
#[derive(Clone)]
pub struct SimSystemHandle {
    shared: Arc<SystemShared>,
}

impl SimSystemHandle {
    /// Plug a camera in. Emits `Detected` on the calling thread when a
    /// subscriber is installed.
    pub fn attach(&self, camera: SimCamera) -> bool {
        let shared = camera.shared.clone();
        {
            let mut state = self.shared.state.lock();
            state.present.retain(|present| present.id != shared.id);
            state.present.push(shared);
        }
        self.shared.send(HotPlugEvent::Detected(Box::new(camera)))
    }

    /// Unplug a camera. Emits `Missing` when a subscriber is installed.
    pub fn detach(&self, id: &CameraId) -> bool {
        self.shared.state.lock().present.retain(|present| &present.id != id);
        self.shared.send(HotPlugEvent::Missing(id.clone()))
    }

    /// Emit an arbitrary hot-plug event
    pub fn send(&self, event: HotPlugEvent) -> bool {
        self.shared.send(event)
    }

    pub fn is_entered(&self) -> bool {
        self.shared.state.lock().entered
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.state.lock().callback.is_some()
    }

    pub fn present_ids(&self) -> Vec<CameraId> {
        self.shared
            .state
            .lock()
            .present
            .iter()
            .map(|shared| shared.id.clone())
            .collect()
    }

    pub fn set_fail_enter(&self, fail: bool) {
        self.shared.state.lock().fail_enter = fail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collecting_callback() -> (FrameCallback, Arc<Mutex<Vec<Frame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let callback: FrameCallback = Arc::new(move |frame: &DriverFrame<'_>| {
            sink.lock().push(Frame::copy_from(frame).unwrap());
        });
        (callback, frames)
    }

    #[test]
    fn test_manual_camera_emits_on_demand() {
        let (mut camera, probe) = SimCamera::manual("cam1", 4, 2, PixelFormat::Mono8);
        assert!(!probe.emit_frame());

        camera.open().unwrap();
        let (callback, frames) = collecting_callback();
        camera.start_streaming(callback).unwrap();

        assert!(probe.emit_frame());
        assert!(probe.emit_frame());
        assert_eq!(frames.lock().len(), 2);
        assert_eq!(frames.lock()[1].sequence(), 2);
        assert_eq!(probe.buffers_returned(), probe.frames_emitted());

        camera.stop_streaming().unwrap();
        assert!(!probe.emit_frame());
        assert_eq!(probe.stream_stops(), 1);
    }

    #[test]
    fn test_stream_requires_open() {
        let (mut camera, _probe) = SimCamera::manual("cam1", 2, 2, PixelFormat::Mono8);
        let (callback, _) = collecting_callback();
        assert!(matches!(
            camera.start_streaming(callback),
            Err(CameraError::Stream(_))
        ));
    }

    #[test]
    fn test_settings_rejected_while_streaming() {
        let (mut camera, probe) = SimCamera::manual("cam1", 2, 2, PixelFormat::Mono8);
        camera.open().unwrap();
        let (callback, _) = collecting_callback();
        camera.start_streaming(callback).unwrap();

        assert!(camera.load_settings(Path::new("a.xml")).is_err());
        camera.stop_streaming().unwrap();
        camera.load_settings(Path::new("a.xml")).unwrap();
        assert_eq!(probe.loaded_settings(), vec![PathBuf::from("a.xml")]);
    }

    #[test]
    fn test_free_running_camera() {
        let (mut camera, probe) = SimCamera::new("cam1", 2, 2, PixelFormat::Mono8, 200);
        camera.open().unwrap();
        let (callback, frames) = collecting_callback();
        camera.start_streaming(callback).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        camera.stop_streaming().unwrap();
        let seen = frames.lock().len();
        assert!(seen > 0);

        // No callbacks after stop_streaming returned
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(frames.lock().len(), seen);
        assert_eq!(probe.frames_emitted(), seen as u64);
    }

    #[test]
    fn test_hot_plug_events_reach_subscriber() {
        let mut system = SimCameraSystem::new();
        let handle = system.handle();
        system.enter().unwrap();

        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        system
            .subscribe(Arc::new(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let (camera, _probe) = SimCamera::manual("cam2", 2, 2, PixelFormat::Mono8);
        assert!(handle.attach(camera));
        assert_eq!(handle.present_ids(), vec![CameraId::from("cam2")]);
        assert_eq!(system.cameras().unwrap().len(), 1);

        assert!(handle.detach(&CameraId::from("cam2")));
        assert!(handle.present_ids().is_empty());

        system.unsubscribe();
        assert!(!handle.send(HotPlugEvent::Unknown(CameraId::from("cam2"))));
        assert_eq!(events.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_enumeration_requires_enter() {
        let mut system = SimCameraSystem::new();
        assert!(system.cameras().is_err());

        system.handle().set_fail_enter(true);
        assert!(matches!(system.enter(), Err(CameraError::System(_))));
    }
}
