//! Camera stations
//!
//! A station is the application's view of one lab camera: its definition,
//! a preview display and a recorder. The station board follows registry
//! notifications and wires each station to its camera when it appears.

use std::path::Path;
use std::sync::Arc;

use camera_capture::{
    AcquisitionState, CameraError, CameraHandler, CameraId, FrameHandler, HandlerError,
    HandlerKind, RegistryEvent, RegistryListener,
};
use frame_handlers::{
    EncoderBackend, FfmpegBackend, FrameDisplay, OffscreenSurface, VideoWriter, Y4mBackend,
};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{AppConfig, CameraDefinition, EncoderKind};

/// Station error types
#[derive(Error, Debug)]
pub enum StationError {
    #[error("Unknown handler {handler} for station {station}")]
    UnknownHandler { station: String, handler: String },

    #[error("Station {station} has no {kind} handler")]
    MissingHandler { station: String, kind: &'static str },

    #[error("Station {station} already has a {kind} handler")]
    DuplicateHandler { station: String, kind: &'static str },

    #[error("Camera for station {0} is missing")]
    CameraMissing(String),

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Derived station status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraStatus {
    Missing,
    NotInitialized,
    Running,
    Displaying,
    Writing,
    WritingAndDisplaying,
}

impl std::fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CameraStatus::Missing => "Missing",
            CameraStatus::NotInitialized => "Not initialized",
            CameraStatus::Running => "Running",
            CameraStatus::Displaying => "Displaying",
            CameraStatus::Writing => "Writing",
            CameraStatus::WritingAndDisplaying => "Writing and Displaying",
        };
        f.write_str(label)
    }
}

/// One camera definition with its display and writer
pub struct CameraStation {
    definition: CameraDefinition,
    display: Arc<dyn FrameHandler>,
    writer: Arc<dyn FrameHandler>,
    camera: Mutex<Option<Arc<CameraHandler>>>,
}

impl CameraStation {
    /// Group `handlers` by kind. Exactly one display and one writer are
    /// required.
    pub fn from_handlers(
        definition: CameraDefinition,
        handlers: Vec<Arc<dyn FrameHandler>>,
    ) -> Result<Self, StationError> {
        let mut display = None;
        let mut writer = None;

        for handler in handlers {
            let (slot, kind) = match handler.kind() {
                HandlerKind::Display => (&mut display, "display"),
                HandlerKind::Writer => (&mut writer, "writer"),
                HandlerKind::Custom => {
                    return Err(StationError::UnknownHandler {
                        station: definition.name.clone(),
                        handler: handler.name().to_string(),
                    })
                }
            };
            if slot.is_some() {
                return Err(StationError::DuplicateHandler {
                    station: definition.name.clone(),
                    kind,
                });
            }
            *slot = Some(handler);
        }

        let display = display.ok_or_else(|| StationError::MissingHandler {
            station: definition.name.clone(),
            kind: "display",
        })?;
        let writer = writer.ok_or_else(|| StationError::MissingHandler {
            station: definition.name.clone(),
            kind: "writer",
        })?;

        Ok(Self {
            definition,
            display,
            writer,
            camera: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn camera_id(&self) -> CameraId {
        self.definition.camera_id()
    }

    pub fn settings_file(&self) -> Option<&Path> {
        self.definition.settings_file.as_deref()
    }

    pub fn display(&self) -> &Arc<dyn FrameHandler> {
        &self.display
    }

    pub fn writer(&self) -> &Arc<dyn FrameHandler> {
        &self.writer
    }

    /// Wire the station to a newly registered camera
    pub fn attach(&self, camera: Arc<CameraHandler>) -> Result<(), StationError> {
        if let Some(path) = &self.definition.settings_file {
            camera.set_config_file(path.clone());
        }
        camera.register_frame_handler(self.display.clone())?;
        camera.register_frame_handler(self.writer.clone())?;

        info!("Station {}: attached to camera {}", self.definition.name, camera.id());
        *self.camera.lock() = Some(camera);
        Ok(())
    }

    /// The camera was unplugged. Its handlers were stopped by the camera
    /// shutdown.
    pub fn mark_missing(&self) {
        if self.camera.lock().take().is_some() {
            warn!("Station {}: camera {} missing", self.definition.name, self.definition.id);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.camera.lock().is_some()
    }

    pub fn status(&self) -> CameraStatus {
        let camera = self.camera.lock();
        let Some(camera) = camera.as_ref() else {
            return CameraStatus::Missing;
        };

        match (self.display.is_running(), self.writer.is_running()) {
            (true, true) => CameraStatus::WritingAndDisplaying,
            (true, false) => CameraStatus::Displaying,
            (false, true) => CameraStatus::Writing,
            (false, false) => match camera.state() {
                AcquisitionState::Streaming | AcquisitionState::Paused => CameraStatus::Running,
                AcquisitionState::Idle | AcquisitionState::Stopped => CameraStatus::NotInitialized,
            },
        }
    }

    pub fn start_recording(&self) -> Result<(), StationError> {
        self.require_camera()?;
        self.writer.start()?;
        Ok(())
    }

    pub fn stop_recording(&self) -> Result<(), StationError> {
        self.writer.stop()?;
        Ok(())
    }

    pub fn open_preview(&self) -> Result<(), StationError> {
        self.require_camera()?;
        self.display.start()?;
        Ok(())
    }

    pub fn close_preview(&self) -> Result<(), StationError> {
        self.display.stop()?;
        Ok(())
    }

    /// Stop whichever handlers are running
    pub fn shutdown(&self) {
        for handler in [&self.display, &self.writer] {
            if handler.is_running() {
                if let Err(e) = handler.stop() {
                    error!("Station {}: stopping {} failed: {}", self.definition.name, handler.name(), e);
                }
            }
        }
    }

    fn require_camera(&self) -> Result<(), StationError> {
        if self.is_attached() {
            Ok(())
        } else {
            Err(StationError::CameraMissing(self.definition.name.clone()))
        }
    }
}

/// All stations of the lab, driven by registry notifications
pub struct StationBoard {
    stations: Vec<Arc<CameraStation>>,
    auto_record: bool,
}

impl StationBoard {
    pub fn new(stations: Vec<CameraStation>) -> Self {
        Self {
            stations: stations.into_iter().map(Arc::new).collect(),
            auto_record: false,
        }
    }

    /// Build one station per configured camera with an offscreen preview
    /// and a writer using the configured encoder
    pub fn from_config(config: &AppConfig) -> Result<Self, StationError> {
        let backend: Arc<dyn EncoderBackend> = match config.writer.encoder {
            EncoderKind::Ffmpeg => Arc::new(FfmpegBackend::new()),
            EncoderKind::Y4m => Arc::new(Y4mBackend),
        };

        let stations = config
            .cameras
            .iter()
            .map(|definition| {
                let display: Arc<dyn FrameHandler> = Arc::new(FrameDisplay::with_size(
                    format!("{}-display", definition.name),
                    Arc::new(OffscreenSurface::new()),
                    config.display_size(),
                ));
                let writer: Arc<dyn FrameHandler> = Arc::new(VideoWriter::with_backend(
                    config.writer_config(definition),
                    backend.clone(),
                ));
                CameraStation::from_handlers(definition.clone(), vec![display, writer])
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(stations))
    }

    /// Start recording as soon as a station's camera appears
    pub fn with_auto_record(mut self, enabled: bool) -> Self {
        self.auto_record = enabled;
        self
    }

    pub fn stations(&self) -> &[Arc<CameraStation>] {
        &self.stations
    }

    pub fn station(&self, name: &str) -> Option<&Arc<CameraStation>> {
        self.stations.iter().find(|s| s.name() == name)
    }

    pub fn station_for(&self, id: &CameraId) -> Option<&Arc<CameraStation>> {
        self.stations.iter().find(|s| s.definition.id == id.as_str())
    }

    pub fn handle_event(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::CameraRegistered(camera) => {
                let Some(station) = self.station_for(camera.id()) else {
                    error!("Camera {} is not part of the configured setup", camera.id());
                    return;
                };
                if let Err(e) = station.attach(camera.clone()) {
                    error!("Station {}: {}", station.name(), e);
                    return;
                }
                if self.auto_record {
                    if let Err(e) = station.start_recording() {
                        error!("Station {}: failed to start recording: {}", station.name(), e);
                    }
                }
            }
            RegistryEvent::CameraMissing(id) => match self.station_for(id) {
                Some(station) => station.mark_missing(),
                None => error!("Camera {} is not part of the configured setup", id),
            },
        }
    }

    /// Registry listener forwarding to [`StationBoard::handle_event`]
    pub fn listener(self: &Arc<Self>) -> RegistryListener {
        let board = self.clone();
        Arc::new(move |event| board.handle_event(event))
    }

    pub fn statuses(&self) -> Vec<(String, CameraStatus)> {
        self.stations
            .iter()
            .map(|s| (s.name().to_string(), s.status()))
            .collect()
    }

    pub fn log_status(&self) {
        for (name, status) in self.statuses() {
            info!("Station {}: {}", name, status);
        }
    }

    pub fn shutdown(&self) {
        for station in &self.stations {
            station.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_capture::sim::{SimCamera, SimCameraSystem};
    use camera_capture::{
        AcquisitionConfig, CameraRegistry, Frame, HandlerNotifier, PixelFormat, RegistryConfig,
    };
    use frame_handlers::VideoWriterConfig;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn acquisition_config() -> AcquisitionConfig {
        AcquisitionConfig {
            poll_interval: Duration::from_millis(2),
            ..Default::default()
        }
    }

    fn definition(name: &str, id: &str) -> CameraDefinition {
        CameraDefinition {
            name: name.to_string(),
            id: id.to_string(),
            settings_file: None,
        }
    }

    fn display(name: &str) -> Arc<dyn FrameHandler> {
        Arc::new(FrameDisplay::with_size(
            format!("{}-display", name),
            Arc::new(OffscreenSurface::new()),
            (4, 4),
        ))
    }

    fn writer(dir: &Path, name: &str) -> Arc<dyn FrameHandler> {
        Arc::new(VideoWriter::with_backend(
            VideoWriterConfig {
                name: name.to_string(),
                output_dir: dir.to_path_buf(),
                frame_size: (4, 4),
                ..Default::default()
            },
            Arc::new(Y4mBackend),
        ))
    }

    fn station(dir: &Path, definition: CameraDefinition) -> CameraStation {
        let name = definition.name.clone();
        CameraStation::from_handlers(definition, vec![display(&name), writer(dir, &name)]).unwrap()
    }

    struct Probe {
        notifier: HandlerNotifier,
    }

    impl FrameHandler for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        fn start(&self) -> Result<(), HandlerError> {
            Ok(())
        }

        fn stop(&self) -> Result<(), HandlerError> {
            Ok(())
        }

        fn is_running(&self) -> bool {
            false
        }

        fn add_frame(&self, _frame: &Frame) -> Result<(), HandlerError> {
            Ok(())
        }

        fn notifier(&self) -> &HandlerNotifier {
            &self.notifier
        }
    }

    #[test]
    fn test_custom_handler_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let probe: Arc<dyn FrameHandler> = Arc::new(Probe {
            notifier: HandlerNotifier::new(),
        });

        let result = CameraStation::from_handlers(
            definition("camera1", "cam1"),
            vec![display("camera1"), writer(dir.path(), "camera1"), probe],
        );
        assert!(matches!(result, Err(StationError::UnknownHandler { handler, .. }) if handler == "probe"));
    }

    #[test]
    fn test_missing_writer_rejected() {
        let result = CameraStation::from_handlers(definition("camera1", "cam1"), vec![display("camera1")]);
        assert!(matches!(
            result,
            Err(StationError::MissingHandler { kind: "writer", .. })
        ));
    }

    #[test]
    fn test_missing_display_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = CameraStation::from_handlers(
            definition("camera1", "cam1"),
            vec![writer(dir.path(), "camera1")],
        );
        assert!(matches!(
            result,
            Err(StationError::MissingHandler { kind: "display", .. })
        ));
    }

    #[test]
    fn test_second_display_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = CameraStation::from_handlers(
            definition("camera1", "cam1"),
            vec![display("a"), display("b"), writer(dir.path(), "camera1")],
        );
        assert!(matches!(
            result,
            Err(StationError::DuplicateHandler { kind: "display", .. })
        ));
    }

    #[test]
    fn test_status_follows_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let station = station(dir.path(), definition("camera1", "cam1"));
        assert_eq!(station.status(), CameraStatus::Missing);
        assert!(matches!(
            station.start_recording(),
            Err(StationError::CameraMissing(_))
        ));

        let (device, _probe) = SimCamera::manual("cam1", 4, 4, PixelFormat::Mono8);
        let camera = Arc::new(CameraHandler::new(Box::new(device), acquisition_config()).unwrap());
        station.attach(camera.clone()).unwrap();
        assert_eq!(station.status(), CameraStatus::NotInitialized);
        assert_eq!(camera.handler_count(), 2);

        camera.start().unwrap();
        assert!(wait_until(|| station.status() == CameraStatus::Running));

        station.open_preview().unwrap();
        assert_eq!(station.status(), CameraStatus::Displaying);
        station.start_recording().unwrap();
        assert_eq!(station.status(), CameraStatus::WritingAndDisplaying);
        station.close_preview().unwrap();
        assert_eq!(station.status(), CameraStatus::Writing);
        station.stop_recording().unwrap();
        assert_eq!(station.status(), CameraStatus::Running);

        station.mark_missing();
        assert_eq!(station.status(), CameraStatus::Missing);
        camera.quit();
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(CameraStatus::WritingAndDisplaying.to_string(), "Writing and Displaying");
        assert_eq!(CameraStatus::Missing.to_string(), "Missing");
    }

    #[test]
    fn test_board_follows_hot_plug() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = definition("camera1", "cam1");
        first.settings_file = Some(PathBuf::from("camera1.xml"));
        let board = Arc::new(StationBoard::new(vec![
            station(dir.path(), first),
            station(dir.path(), definition("camera2", "cam2")),
        ]));

        let registry = CameraRegistry::new(RegistryConfig {
            acquisition: acquisition_config(),
            ..Default::default()
        });
        registry.subscribe(board.listener());

        let system = SimCameraSystem::new();
        let handle = system.handle();
        registry.start(Box::new(system)).unwrap();
        assert!(wait_until(|| handle.is_subscribed()));

        let (device, probe) = SimCamera::manual("cam1", 4, 4, PixelFormat::Mono8);
        handle.attach(device);
        let camera1 = board.station("camera1").unwrap();
        assert!(camera1.is_attached());
        assert!(wait_until(|| camera1.status() == CameraStatus::Running));
        assert!(wait_until(|| probe.loaded_settings() == vec![PathBuf::from("camera1.xml")]));
        assert_eq!(board.station("camera2").unwrap().status(), CameraStatus::Missing);

        // Not part of the setup: registered by the registry, ignored here
        let (stranger, _) = SimCamera::manual("cam9", 4, 4, PixelFormat::Mono8);
        handle.attach(stranger);
        assert_eq!(registry.len(), 2);
        assert_eq!(board.stations().iter().filter(|s| s.is_attached()).count(), 1);

        handle.detach(&"cam1".into());
        assert_eq!(camera1.status(), CameraStatus::Missing);

        registry.quit();
    }

    #[test]
    fn test_auto_record_starts_writer_on_registration() {
        let dir = tempfile::tempdir().unwrap();
        let board = Arc::new(
            StationBoard::new(vec![station(dir.path(), definition("camera1", "cam1"))])
                .with_auto_record(true),
        );
        let registry = CameraRegistry::new(RegistryConfig {
            acquisition: acquisition_config(),
            ..Default::default()
        });
        registry.subscribe(board.listener());

        let (device, probe) = SimCamera::manual("cam1", 4, 4, PixelFormat::Mono8);
        registry
            .start(Box::new(SimCameraSystem::with_cameras(vec![device])))
            .unwrap();

        let station = board.station("camera1").unwrap();
        assert!(wait_until(|| station.status() == CameraStatus::Writing));
        assert!(wait_until(|| probe.is_streaming()));

        board.shutdown();
        assert!(wait_until(|| station.status() == CameraStatus::Running));
        // Shutdown releases cameras without missing notifications
        registry.quit();
        assert_eq!(station.status(), CameraStatus::NotInitialized);
    }

    #[test]
    fn test_board_from_default_config() {
        let board = StationBoard::from_config(&AppConfig::default()).unwrap();
        let names: Vec<&str> = board.stations().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["camera1", "camera2", "camera3", "camera4"]);
        assert!(board.station_for(&"cam3".into()).is_some());
        assert!(board
            .statuses()
            .iter()
            .all(|(_, status)| *status == CameraStatus::Missing));
    }
}
