//! Video frame types and pixel conversions

use crate::sdk::DriverFrame;
use crate::CameraError;

/// Pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit monochrome
    Mono8,
    /// 8-bit interleaved RGB
    Rgb8,
    /// 8-bit interleaved BGR
    Bgr8,
}

impl PixelFormat {
    /// Bytes used by one pixel
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
        }
    }

    /// Buffer length required for a `width` x `height` image
    pub fn buffer_len(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

/// An owned, immutable camera frame
///
/// Frames never alias driver memory: the pixel buffer is always copied out of
/// the driver ring buffer before the frame callback returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    /// Capture timestamp (nanoseconds, driver clock)
    timestamp_ns: u64,
    /// Driver frame sequence number
    sequence: u64,
}

impl Frame {
    /// Create a frame from an owned pixel buffer
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, CameraError> {
        let expected = format.buffer_len(width, height);
        if data.len() != expected {
            return Err(CameraError::Format(format!(
                "{}x{} {:?} needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                data.len()
            )));
        }

        Ok(Self {
            data,
            width,
            height,
            format,
            timestamp_ns: 0,
            sequence: 0,
        })
    }

    /// Deep-copy a frame out of a driver-owned buffer
    pub fn copy_from(frame: &DriverFrame<'_>) -> Result<Self, CameraError> {
        let expected = frame.format.buffer_len(frame.width, frame.height);
        if frame.buffer.len() < expected {
            return Err(CameraError::Format(format!(
                "driver buffer holds {} bytes, {}x{} {:?} needs {}",
                frame.buffer.len(),
                frame.width,
                frame.height,
                frame.format,
                expected
            )));
        }

        Ok(Self {
            data: frame.buffer[..expected].to_vec(),
            width: frame.width,
            height: frame.height,
            format: frame.format,
            timestamp_ns: frame.timestamp_ns,
            sequence: frame.sequence,
        })
    }

    /// Black frame of the given shape
    pub fn blank(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: vec![0; format.buffer_len(width, height)],
            width,
            height,
            format,
            timestamp_ns: 0,
            sequence: 0,
        }
    }

    /// Attach capture timing metadata
    pub fn with_timing(mut self, timestamp_ns: u64, sequence: u64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self.sequence = sequence;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(width, height)`
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Consume the frame and return its pixel buffer
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Get pixel at (x, y) as stored (1 or 3 channels)
    pub fn get_pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let idx = (y as usize * self.width as usize + x as usize) * bpp;
        Some(&self.data[idx..idx + bpp])
    }

    /// Convert to grayscale bytes
    pub fn to_grayscale(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Mono8 => self.data.clone(),
            PixelFormat::Rgb8 => self.data.chunks_exact(3).map(|p| luma(p[0], p[1], p[2])).collect(),
            PixelFormat::Bgr8 => self.data.chunks_exact(3).map(|p| luma(p[2], p[1], p[0])).collect(),
        }
    }

    /// Convert to interleaved RGB bytes
    pub fn to_rgb(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Rgb8 => self.data.clone(),
            PixelFormat::Bgr8 => swap_red_blue(&self.data),
            PixelFormat::Mono8 => self.data.iter().flat_map(|&v| [v, v, v]).collect(),
        }
    }

    /// Convert to interleaved BGR bytes
    pub fn to_bgr(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Bgr8 => self.data.clone(),
            PixelFormat::Rgb8 => swap_red_blue(&self.data),
            PixelFormat::Mono8 => self.data.iter().flat_map(|&v| [v, v, v]).collect(),
        }
    }

    /// Convert the frame to another pixel format
    pub fn convert(&self, target: PixelFormat) -> Frame {
        let data = match target {
            PixelFormat::Mono8 => self.to_grayscale(),
            PixelFormat::Rgb8 => self.to_rgb(),
            PixelFormat::Bgr8 => self.to_bgr(),
        };

        Frame {
            data,
            width: self.width,
            height: self.height,
            format: target,
            timestamp_ns: self.timestamp_ns,
            sequence: self.sequence,
        }
    }
}

// Luminance formula: 0.299*R + 0.587*G + 0.114*B
fn luma(r: u8, g: u8, b: u8) -> u8 {
    (r as f32 * 0.299 + g as f32 * 0.587 + b as f32 * 0.114).round() as u8
}

fn swap_red_blue(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(3).flat_map(|p| [p[2], p[1], p[0]]).collect()
}
