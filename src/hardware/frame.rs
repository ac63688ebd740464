use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Opaque key identifying a physical (or logical) camera.
pub type DeviceId = Arc<str>;

/// Hardware-assigned buffer id, unique within one device while outstanding.
pub type FrameId = u32;

/// One frame buffer lent out by a camera device
///
/// The pixel payload is reference counted, so fanning the same buffer out to
/// several client sessions never copies it. The buffer itself is still owned by
/// the hardware until every holder has handed it back.
#[derive(Clone)]
pub struct FrameBuffer {
    /// Device that produced this buffer
    pub device_id: DeviceId,

    /// Buffer slot id, returned to the hardware when released
    pub frame_id: FrameId,

    /// Device timestamp, monotonic within one stream
    pub timestamp: Duration,

    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("device_id", &self.device_id)
            .field("frame_id", &self.frame_id)
            .field("timestamp", &self.timestamp)
            .field("len", &self.data.len())
            .field("sequence", &self.meta.sequence)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel of a packed frame; compressed formats report the
    /// worst case of their decoded size.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Mjpeg => 3,
            PixelFormat::Yuyv4 => 2,
            PixelFormat::Nv12 => 1,
        }
    }
}

/// Stream configuration a device is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

impl StreamConfig {
    /// Nominal time between two frames
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.fps.max(1)))
    }

    /// Size of one packed frame
    pub fn frame_size(&self) -> usize {
        match self.format {
            PixelFormat::Nv12 => (self.width * self.height * 3 / 2) as usize,
            other => (self.width * self.height * other.bytes_per_pixel()) as usize,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Rgb24,
        }
    }
}
