//! Video encoder backends
//!
//! A backend opens one encoder per recording. Encoders take packed frames in
//! the recording's color mode (`gray` or `rgb24`) and finalise the file on
//! `finish`.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};

use camera_capture::PixelFormat;
use tracing::{debug, info, warn};

/// Color mode of a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMode {
    /// Single-channel 8-bit
    #[default]
    Grayscale,
    /// 8-bit RGB
    Color,
}

impl ColorMode {
    /// Pixel layout expected by `FrameEncoder::write_frame`
    pub fn pixel_format(self) -> PixelFormat {
        match self {
            ColorMode::Grayscale => PixelFormat::Mono8,
            ColorMode::Color => PixelFormat::Rgb8,
        }
    }
}

/// Recording parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub color: ColorMode,
}

impl EncoderParams {
    /// Bytes in one packed input frame
    pub fn frame_len(&self) -> usize {
        self.color.pixel_format().buffer_len(self.width, self.height)
    }
}

/// Factory for encoders writing one container format
pub trait EncoderBackend: Send + Sync {
    /// File extension without the dot
    fn extension(&self) -> &'static str;

    /// Create `path` and prepare it for frames
    fn open(&self, path: &Path, params: &EncoderParams) -> io::Result<Box<dyn FrameEncoder>>;
}

/// An open recording
pub trait FrameEncoder: Send {
    /// Append one packed frame
    fn write_frame(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush and close the file
    fn finish(self: Box<Self>) -> io::Result<()>;
}

fn check_frame_len(data: &[u8], params: &EncoderParams) -> io::Result<()> {
    let expected = params.frame_len();
    if data.len() != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame holds {} bytes, expected {}", data.len(), expected),
        ));
    }
    Ok(())
}

// ============================================================================
// FFmpeg
// ============================================================================

/// MPEG-4 Part 2 (`mp4v`) in an `.mp4` container, encoded by an `ffmpeg`
/// subprocess fed raw frames over stdin
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    program: PathBuf,
}

impl FfmpegBackend {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
        }
    }

    /// Use a specific ffmpeg binary
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(path: &Path, params: &EncoderParams) -> Vec<String> {
        let pix_fmt = match params.color {
            ColorMode::Grayscale => "gray",
            ColorMode::Color => "rgb24",
        };

        vec![
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            pix_fmt.into(),
            "-s".into(),
            format!("{}x{}", params.width, params.height),
            "-r".into(),
            params.fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-c:v".into(),
            "mpeg4".into(),
            "-tag:v".into(),
            "mp4v".into(),
            "-q:v".into(),
            "3".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-y".into(),
            path.display().to_string(),
        ]
    }
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderBackend for FfmpegBackend {
    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn open(&self, path: &Path, params: &EncoderParams) -> io::Result<Box<dyn FrameEncoder>> {
        let mut child = Command::new(&self.program)
            .args(Self::args(path, params))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("failed to spawn {}: {}", self.program.display(), e),
                )
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("ffmpeg stdin unavailable"))?;
        let stderr = match child.stderr.take().map(drain_stderr).transpose() {
            Ok(stderr) => stderr,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        info!(
            "FFmpeg encoder started for {} ({}x{} @ {} fps)",
            path.display(),
            params.width,
            params.height,
            params.fps
        );

        Ok(Box::new(FfmpegEncoder {
            child: Some(child),
            stdin: Some(BufWriter::new(stdin)),
            stderr,
            params: *params,
        }))
    }
}

// ffmpeg blocks once its stderr pipe is full, so the pipe is read
// continuously and the text kept for error reports
fn drain_stderr(mut stderr: impl Read + Send + 'static) -> io::Result<JoinHandle<String>> {
    thread::Builder::new()
        .name("ffmpeg-stderr".to_string())
        .spawn(move || {
            let mut text = Vec::new();
            if let Err(e) = stderr.read_to_end(&mut text) {
                debug!("FFmpeg stderr closed: {}", e);
            }
            String::from_utf8_lossy(&text).into_owned()
        })
}

struct FfmpegEncoder {
    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    stderr: Option<JoinHandle<String>>,
    params: EncoderParams,
}

impl FfmpegEncoder {
    fn stderr_text(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default()
    }
}

impl FrameEncoder for FfmpegEncoder {
    fn write_frame(&mut self, data: &[u8]) -> io::Result<()> {
        check_frame_len(data, &self.params)?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "encoder already closed"))?;
        stdin.write_all(data)
    }

    fn finish(mut self: Box<Self>) -> io::Result<()> {
        // Closing stdin ends the input stream; ffmpeg then writes the trailer
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush()?;
        }
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let status = child.wait()?;
        let stderr = self.stderr_text();
        if !status.success() {
            return Err(io::Error::other(format!(
                "ffmpeg exited with {}: {}",
                status,
                stderr.trim()
            )));
        }
        debug!("FFmpeg encoder finished");
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        self.stdin.take();
        if let Some(mut child) = self.child.take() {
            warn!("FFmpeg encoder dropped without finish, killing process");
            let _ = child.kill();
            let _ = child.wait();
        }
        self.stderr_text();
    }
}

// ============================================================================
// YUV4MPEG2
// ============================================================================

/// Uncompressed YUV4MPEG2 (`.y4m`), written in-process.
///
/// Grayscale recordings use the `mono` colorspace; color recordings are
/// converted to BT.601 studio-range 4:4:4.
#[derive(Debug, Clone, Copy, Default)]
pub struct Y4mBackend;

impl EncoderBackend for Y4mBackend {
    fn extension(&self) -> &'static str {
        "y4m"
    }

    fn open(&self, path: &Path, params: &EncoderParams) -> io::Result<Box<dyn FrameEncoder>> {
        let colorspace = match params.color {
            ColorMode::Grayscale => "mono",
            ColorMode::Color => "444",
        };

        let mut out = BufWriter::new(File::create(path)?);
        writeln!(
            out,
            "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C{}",
            params.width, params.height, params.fps, colorspace
        )?;

        Ok(Box::new(Y4mEncoder {
            out,
            params: *params,
            planes: Vec::new(),
        }))
    }
}

struct Y4mEncoder {
    out: BufWriter<File>,
    params: EncoderParams,
    // Reused plane buffer for color conversion
    planes: Vec<u8>,
}

impl FrameEncoder for Y4mEncoder {
    fn write_frame(&mut self, data: &[u8]) -> io::Result<()> {
        check_frame_len(data, &self.params)?;
        self.out.write_all(b"FRAME\n")?;

        match self.params.color {
            ColorMode::Grayscale => self.out.write_all(data),
            ColorMode::Color => {
                rgb_to_yuv444(data, &mut self.planes);
                self.out.write_all(&self.planes)
            }
        }
    }

    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }
}

// Planar Y, Cb, Cr (BT.601, studio range)
fn rgb_to_yuv444(rgb: &[u8], planes: &mut Vec<u8>) {
    let pixels = rgb.len() / 3;
    planes.clear();
    planes.resize(pixels * 3, 0);
    let (y_plane, chroma) = planes.split_at_mut(pixels);
    let (cb_plane, cr_plane) = chroma.split_at_mut(pixels);

    for (i, px) in rgb.chunks_exact(3).enumerate() {
        let (r, g, b) = (f32::from(px[0]), f32::from(px[1]), f32::from(px[2]));
        y_plane[i] = (16.0 + (65.481 * r + 128.553 * g + 24.966 * b) / 255.0).round() as u8;
        cb_plane[i] = (128.0 + (-37.797 * r - 74.203 * g + 112.0 * b) / 255.0).round() as u8;
        cr_plane[i] = (128.0 + (112.0 * r - 93.786 * g - 18.214 * b) / 255.0).round() as u8;
    }
}
