//! Video writer frame handler
//!
//! Records every delivered frame to `{name}_{timestamp}.{ext}` in the output
//! directory. One file per start/stop cycle.
//!
//! State machine: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//! The encoder handle lives behind its own mutex so a frame write and a stop
//! never race on it.

use std::borrow::Cow;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camera_capture::{Frame, FrameHandler, HandlerError, HandlerEvent, HandlerKind, HandlerNotifier};
use chrono::Local;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::encoder::{ColorMode, EncoderBackend, EncoderParams, FfmpegBackend, FrameEncoder};

/// Video writer configuration
#[derive(Debug, Clone)]
pub struct VideoWriterConfig {
    /// Handler name, also the file name prefix
    pub name: String,
    pub output_dir: PathBuf,
    pub fps: u32,
    /// Required `(width, height)` of every frame
    pub frame_size: (u32, u32),
    pub color: ColorMode,
    /// Stop the writer after this many write failures in a row.
    /// `None` keeps recording whatever happens.
    pub max_consecutive_write_failures: Option<u32>,
    pub lock_timeout: Duration,
}

impl Default for VideoWriterConfig {
    fn default() -> Self {
        Self {
            name: "video".to_string(),
            output_dir: PathBuf::from("recordings"),
            fps: 10,
            frame_size: (640, 480),
            color: ColorMode::Grayscale,
            max_consecutive_write_failures: None,
            lock_timeout: Duration::from_secs(1),
        }
    }
}

/// Writer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Recording {
    encoder: Box<dyn FrameEncoder>,
    path: PathBuf,
    consecutive_failures: u32,
}

/// Frame handler writing a video file per recording session
pub struct VideoWriter {
    config: VideoWriterConfig,
    backend: Arc<dyn EncoderBackend>,
    output_dir: Mutex<PathBuf>,
    state: Mutex<WriterState>,
    // Serialises start/stop/change_output_dir
    transition: Mutex<()>,
    recording: Mutex<Option<Recording>>,
    output_path: Mutex<Option<PathBuf>>,
    frames_written: AtomicU64,
    notifier: HandlerNotifier,
}

impl VideoWriter {
    /// Writer producing `.mp4` files through ffmpeg
    pub fn new(config: VideoWriterConfig) -> Self {
        Self::with_backend(config, Arc::new(FfmpegBackend::new()))
    }

    pub fn with_backend(config: VideoWriterConfig, backend: Arc<dyn EncoderBackend>) -> Self {
        Self {
            output_dir: Mutex::new(config.output_dir.clone()),
            config,
            backend,
            state: Mutex::new(WriterState::Stopped),
            transition: Mutex::new(()),
            recording: Mutex::new(None),
            output_path: Mutex::new(None),
            frames_written: AtomicU64::new(0),
            notifier: HandlerNotifier::new(),
        }
    }

    pub fn state(&self) -> WriterState {
        *self.state.lock()
    }

    /// Path of the current recording, or of the last one once stopped
    pub fn output_path(&self) -> Option<PathBuf> {
        self.output_path.lock().clone()
    }

    /// Frames written in the current (or last) recording
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.lock().clone()
    }

    pub fn frame_size(&self) -> (u32, u32) {
        self.config.frame_size
    }

    /// Switch the output directory. Refused while recording.
    pub fn change_output_dir(&self, path: impl Into<PathBuf>) -> bool {
        let path = path.into();
        let Some(_transition) = self.transition.try_lock_for(self.config.lock_timeout) else {
            error!("Writer {}: timed out changing output directory", self.config.name);
            return false;
        };
        if self.state() != WriterState::Stopped {
            warn!(
                "Writer {}: cannot change output directory to {} while recording",
                self.config.name,
                path.display()
            );
            return false;
        }

        info!("Writer {}: output directory set to {}", self.config.name, path.display());
        *self.output_dir.lock() = path;
        true
    }

    fn set_state(&self, state: WriterState) {
        let mut current = self.state.lock();
        debug!("Writer {}: {:?} -> {:?}", self.config.name, *current, state);
        *current = state;
    }

    fn lock_transition(&self) -> Result<MutexGuard<'_, ()>, HandlerError> {
        self.transition
            .try_lock_for(self.config.lock_timeout)
            .ok_or_else(|| {
                error!("Writer {}: timed out waiting for start/stop", self.config.name);
                HandlerError::LockTimeout("writer transition")
            })
    }

    fn params(&self) -> EncoderParams {
        EncoderParams {
            width: self.config.frame_size.0,
            height: self.config.frame_size.1,
            fps: self.config.fps,
            color: self.config.color,
        }
    }

    fn open_recording(&self) -> Result<Recording, HandlerError> {
        let dir = self.output_dir();
        fs::create_dir_all(&dir)?;
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S-%3f").to_string();
        let path = claim_output_path(&dir, &self.config.name, &stamp, self.backend.extension())?;

        match self.backend.open(&path, &self.params()) {
            Ok(encoder) => Ok(Recording {
                encoder,
                path,
                consecutive_failures: 0,
            }),
            Err(e) => {
                // Release the claimed name
                let _ = fs::remove_file(&path);
                Err(e.into())
            }
        }
    }

    /// Detach the active recording. Fails without touching it when a frame
    /// write holds the encoder past the lock timeout.
    fn take_recording(&self) -> Result<Option<Recording>, HandlerError> {
        match self.recording.try_lock_for(self.config.lock_timeout) {
            Some(mut recording) => Ok(recording.take()),
            None => {
                error!("Writer {}: timed out waiting for the encoder", self.config.name);
                Err(HandlerError::LockTimeout("writer encoder"))
            }
        }
    }

    fn finish_recording(&self, active: Recording) -> Result<(), HandlerError> {
        let path = active.path.clone();
        match active.encoder.finish() {
            Ok(()) => {
                info!(
                    "Writer {}: closed {} ({} frames)",
                    self.config.name,
                    path.display(),
                    self.frames_written()
                );
                Ok(())
            }
            Err(e) => {
                error!("Writer {}: failed to finalise {}: {}", self.config.name, path.display(), e);
                Err(HandlerError::Io(e))
            }
        }
    }

    fn pixels<'a>(&self, frame: &'a Frame) -> Cow<'a, [u8]> {
        if frame.format() == self.config.color.pixel_format() {
            return Cow::Borrowed(frame.data());
        }
        match self.config.color {
            ColorMode::Grayscale => Cow::Owned(frame.to_grayscale()),
            ColorMode::Color => Cow::Owned(frame.to_rgb()),
        }
    }

    fn write(&self, frame: &Frame) -> Result<(), HandlerError> {
        let pixels = self.pixels(frame);

        let Some(mut recording) = self.recording.try_lock_for(self.config.lock_timeout) else {
            warn!(
                "Writer {}: encoder busy, frame {} not written",
                self.config.name,
                frame.sequence()
            );
            return Err(HandlerError::LockTimeout("writer encoder"));
        };
        // Stopped between the running check and here
        let Some(active) = recording.as_mut() else {
            return Ok(());
        };

        match active.encoder.write_frame(&pixels) {
            Ok(()) => {
                active.consecutive_failures = 0;
                self.frames_written.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                active.consecutive_failures += 1;
                warn!(
                    "Writer {}: failed to write frame {}: {}",
                    self.config.name,
                    frame.sequence(),
                    e
                );
                match self.config.max_consecutive_write_failures {
                    Some(limit) if active.consecutive_failures >= limit => {
                        Err(HandlerError::WriteFailures(active.consecutive_failures))
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}

impl FrameHandler for VideoWriter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Writer
    }

    fn start(&self) -> Result<(), HandlerError> {
        {
            let _transition = self.lock_transition()?;
            if self.state() != WriterState::Stopped {
                debug!("Writer {} already running", self.config.name);
                return Ok(());
            }

            self.set_state(WriterState::Starting);
            let recording = match self.open_recording() {
                Ok(recording) => recording,
                Err(e) => {
                    self.set_state(WriterState::Stopped);
                    error!("Writer {}: failed to start: {}", self.config.name, e);
                    return Err(e);
                }
            };

            info!("Writer {}: recording to {}", self.config.name, recording.path.display());
            *self.output_path.lock() = Some(recording.path.clone());
            self.frames_written.store(0, Ordering::Relaxed);
            *self.recording.lock() = Some(recording);
            self.set_state(WriterState::Running);
        }

        self.notifier.notify(HandlerEvent::Started);
        Ok(())
    }

    fn stop(&self) -> Result<(), HandlerError> {
        let finished = {
            let _transition = self.lock_transition()?;
            if self.state() != WriterState::Running {
                warn!("Writer {} is not running", self.config.name);
                return Ok(());
            }

            self.set_state(WriterState::Stopping);
            let active = match self.take_recording() {
                Ok(active) => active,
                Err(e) => {
                    // Still recording; stop can be retried
                    self.set_state(WriterState::Running);
                    return Err(e);
                }
            };
            let finished = match active {
                Some(active) => self.finish_recording(active),
                None => Ok(()),
            };
            self.set_state(WriterState::Stopped);
            finished
        };

        self.notifier.notify(HandlerEvent::Stopped);
        finished
    }

    fn is_running(&self) -> bool {
        self.state() == WriterState::Running
    }

    fn add_frame(&self, frame: &Frame) -> Result<(), HandlerError> {
        if !self.is_running() {
            return Ok(());
        }

        let expected = self.config.frame_size;
        if frame.size() != expected {
            error!(
                "Writer {}: frame is {}x{}, expected {}x{}, stopping",
                self.config.name,
                frame.width(),
                frame.height(),
                expected.0,
                expected.1
            );
            if let Err(e) = self.stop() {
                warn!("Writer {}: {}", self.config.name, e);
            }
            return Err(HandlerError::FrameSizeMismatch {
                expected,
                actual: frame.size(),
            });
        }

        let written = self.write(frame);
        if let Err(HandlerError::WriteFailures(count)) = &written {
            error!(
                "Writer {}: {} consecutive write failures, stopping",
                self.config.name, count
            );
            if let Err(e) = self.stop() {
                warn!("Writer {}: {}", self.config.name, e);
            }
        }
        written
    }

    fn notifier(&self) -> &HandlerNotifier {
        &self.notifier
    }
}

/// Atomically create `{name}_{stamp}.{extension}` in `dir`, adding a random
/// suffix while the name is taken. Existing files are never overwritten.
fn claim_output_path(dir: &Path, name: &str, stamp: &str, extension: &str) -> io::Result<PathBuf> {
    let mut path = dir.join(format!("{}_{}.{}", name, stamp, extension));
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let suffix = Uuid::new_v4().simple().to_string();
                debug!("{} exists, retrying with suffix {}", path.display(), &suffix[..8]);
                path = dir.join(format!("{}_{}_{}.{}", name, stamp, &suffix[..8], extension));
            }
            Err(e) => return Err(e),
        }
    }
}

impl Drop for VideoWriter {
    fn drop(&mut self) {
        if let Some(recording) = self.recording.get_mut().take() {
            if let Err(e) = recording.encoder.finish() {
                error!(
                    "Writer {}: failed to finalise {}: {}",
                    self.config.name,
                    recording.path.display(),
                    e
                );
            }
        }
    }
}
