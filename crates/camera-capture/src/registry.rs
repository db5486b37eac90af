//! Camera registry (hot-plug manager)
//!
//! Runs the device-management session on its own thread: enters the vendor
//! context, registers every camera present at startup, then follows hot-plug
//! events until asked to quit. Each camera gets one [`CameraHandler`];
//! listeners learn about new and lost cameras through [`RegistryEvent`]s.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::acquisition::{AcquisitionConfig, CameraHandler};
use crate::sdk::{CameraDevice, CameraSystem, HotPlugEvent};
use crate::worker::{StopSignal, Worker};
use crate::{CameraError, CameraId};

/// Registry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Idle,
    Running,
    Stopping,
    /// The state lock could not be acquired in time
    Unknown,
}

/// Notification emitted to registry listeners
#[derive(Clone)]
pub enum RegistryEvent {
    /// A new camera is ready for handler registration
    CameraRegistered(Arc<CameraHandler>),
    /// A camera was removed and its acquisition stopped
    CameraMissing(CameraId),
}

impl RegistryEvent {
    pub fn camera_id(&self) -> &CameraId {
        match self {
            RegistryEvent::CameraRegistered(camera) => camera.id(),
            RegistryEvent::CameraMissing(id) => id,
        }
    }
}

impl fmt::Debug for RegistryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryEvent::CameraRegistered(camera) => write!(f, "CameraRegistered({})", camera.id()),
            RegistryEvent::CameraMissing(id) => write!(f, "CameraMissing({})", id),
        }
    }
}

/// Registry listener, called on the thread that delivered the hot-plug event
pub type RegistryListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Bounded wait for the state and camera-map locks
    pub lock_timeout: Duration,
    /// Template for every camera's acquisition
    pub acquisition: AcquisitionConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(1),
            acquisition: AcquisitionConfig::default(),
        }
    }
}

struct Inner {
    config: RegistryConfig,
    cameras: Mutex<BTreeMap<CameraId, Arc<CameraHandler>>>,
    state: Mutex<RegistryState>,
    listeners: Mutex<Vec<RegistryListener>>,
    // Cleared before teardown; no camera is created afterwards
    accepting: AtomicBool,
}

impl Inner {
    fn state(&self) -> RegistryState {
        match self.state.try_lock_for(self.config.lock_timeout) {
            Some(state) => *state,
            None => RegistryState::Unknown,
        }
    }

    fn change_state(&self, new_state: RegistryState) -> bool {
        match self.state.try_lock_for(self.config.lock_timeout) {
            Some(mut state) => {
                if *state != new_state {
                    info!("Camera registry: {:?} -> {:?}", *state, new_state);
                    *state = new_state;
                }
                true
            }
            None => {
                error!(
                    "Camera registry: timed out locking state, transition to {:?} refused",
                    new_state
                );
                false
            }
        }
    }

    fn emit(&self, event: &RegistryEvent) {
        let listeners: Vec<RegistryListener> = self.listeners.lock().clone();
        debug!("Camera registry: emitting {:?} to {} listeners", event, listeners.len());
        for listener in listeners {
            listener(event);
        }
    }

    fn run(self: Arc<Self>, mut system: Box<dyn CameraSystem>, stop: StopSignal) {
        info!("Camera registry thread started");

        if let Err(e) = system.enter() {
            error!("Camera registry: failed to enter camera system: {}", e);
            self.change_state(RegistryState::Idle);
            return;
        }
        self.accepting.store(true, Ordering::SeqCst);

        match system.cameras() {
            Ok(devices) => {
                info!("Camera registry: {} cameras present at startup", devices.len());
                for device in devices {
                    self.on_camera_detected(device);
                }
            }
            Err(e) => error!("Camera registry: camera enumeration failed: {}", e),
        }

        let weak = Arc::downgrade(&self);
        let subscribed = system.subscribe(Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(event);
            }
        }));
        if let Err(e) = subscribed {
            error!("Camera registry: hot-plug notifications unavailable: {}", e);
        }

        stop.wait();

        info!("Camera registry shutting down");
        self.accepting.store(false, Ordering::SeqCst);
        system.unsubscribe();

        let cameras = match self.cameras.try_lock_for(self.config.lock_timeout) {
            Some(mut cameras) => std::mem::take(&mut *cameras),
            None => {
                error!("Camera registry: timed out locking cameras during shutdown");
                BTreeMap::new()
            }
        };
        for (id, camera) in cameras {
            camera.quit();
            debug!("Camera registry: released camera {}", id);
        }

        system.exit();
        self.change_state(RegistryState::Idle);
        info!("Camera registry thread finished");
    }

    fn handle_event(&self, event: HotPlugEvent) {
        if !self.accepting.load(Ordering::SeqCst) {
            debug!("Camera registry: ignoring {:?} during shutdown", event);
            return;
        }
        match self.state() {
            RegistryState::Running => {}
            RegistryState::Stopping => {
                debug!("Camera registry: ignoring {:?} during shutdown", event);
                return;
            }
            state => warn!("Camera registry: {:?} received while {:?}", event, state),
        }

        match event {
            HotPlugEvent::Detected(device) => self.on_camera_detected(device),
            HotPlugEvent::Missing(id) => self.on_camera_missing(&id),
            HotPlugEvent::Reachable(id) => info!("Camera {} reachable", id),
            HotPlugEvent::Unreachable(id) => info!("Camera {} unreachable", id),
            HotPlugEvent::Unknown(id) => warn!("Unknown hot-plug event for camera {}", id),
        }
    }

    fn on_camera_detected(&self, device: Box<dyn CameraDevice>) {
        let id = device.id().clone();

        let camera = {
            let Some(mut cameras) = self.cameras.try_lock_for(self.config.lock_timeout) else {
                error!("Camera registry: timed out locking cameras, detection of {} dropped", id);
                return;
            };
            if cameras.contains_key(&id) {
                warn!("Camera {} detected again, ignoring", id);
                return;
            }

            let camera = match CameraHandler::new(device, self.config.acquisition.clone()) {
                Ok(camera) => Arc::new(camera),
                Err(e) => {
                    error!("Camera {}: {}", id, e);
                    return;
                }
            };
            cameras.insert(id.clone(), camera.clone());
            camera
        };

        info!("Camera {} registered", id);
        self.emit(&RegistryEvent::CameraRegistered(camera.clone()));
        if let Err(e) = camera.start() {
            error!("Camera {}: failed to start acquisition: {}", id, e);
        }
    }

    fn on_camera_missing(&self, id: &CameraId) {
        let removed = match self.cameras.try_lock_for(self.config.lock_timeout) {
            Some(mut cameras) => cameras.remove(id),
            None => {
                error!("Camera registry: timed out locking cameras, removal of {} dropped", id);
                return;
            }
        };

        match removed {
            Some(camera) => {
                camera.quit();
                info!("Camera {} missing", id);
                self.emit(&RegistryEvent::CameraMissing(id.clone()));
            }
            None => warn!("Unknown camera {} reported missing", id),
        }
    }
}

/// Hot-plug camera registry
pub struct CameraRegistry {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker<()>>>,
}

impl CameraRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                cameras: Mutex::new(BTreeMap::new()),
                state: Mutex::new(RegistryState::Idle),
                listeners: Mutex::new(Vec::new()),
                accepting: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Receive camera registered / missing notifications.
    /// Subscribe before [`CameraRegistry::start`] to see startup cameras.
    pub fn subscribe(&self, listener: RegistryListener) {
        self.inner.listeners.lock().push(listener);
    }

    /// Start the registry thread on `system`
    pub fn start(&self, system: Box<dyn CameraSystem>) -> Result<(), CameraError> {
        let mut worker = self.worker.lock();
        match self.inner.state() {
            RegistryState::Idle => {}
            RegistryState::Unknown => return Err(CameraError::LockTimeout("registry state")),
            state => {
                warn!("Camera registry: start requested while {:?}", state);
                return Err(CameraError::AlreadyRunning);
            }
        }
        // Reap a thread that exited on its own
        if let Some(mut finished) = worker.take() {
            finished.stop_and_join();
        }

        if !self.inner.change_state(RegistryState::Running) {
            return Err(CameraError::LockTimeout("registry state"));
        }
        let inner = self.inner.clone();
        match Worker::spawn("camera-registry", move |stop| inner.run(system, stop)) {
            Ok(spawned) => {
                *worker = Some(spawned);
                Ok(())
            }
            Err(e) => {
                self.inner.change_state(RegistryState::Idle);
                Err(e.into())
            }
        }
    }

    /// Stop the registry thread and tear down every camera. Blocks until the
    /// thread has exited.
    pub fn quit(&self) {
        let state = self.inner.state();
        if state != RegistryState::Running {
            warn!("Camera registry: quit requested while {:?}", state);
        }

        let Some(mut worker) = self.worker.lock().take() else {
            return;
        };
        self.inner.change_state(RegistryState::Stopping);
        worker.stop_and_join();
        // Covers a thread that never reached its own teardown
        self.inner.change_state(RegistryState::Idle);
    }

    pub fn state(&self) -> RegistryState {
        self.inner.state()
    }

    pub fn camera(&self, id: &CameraId) -> Option<Arc<CameraHandler>> {
        self.inner
            .cameras
            .try_lock_for(self.inner.config.lock_timeout)
            .and_then(|cameras| cameras.get(id).cloned())
    }

    /// Ids of the registered cameras, sorted
    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.inner
            .cameras
            .try_lock_for(self.inner.config.lock_timeout)
            .map(|cameras| cameras.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.camera_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CameraRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Drop for CameraRegistry {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.lock().take() {
            self.inner.change_state(RegistryState::Stopping);
            worker.stop_and_join();
        }
    }
}
