//! Hardware-facing collaborator contract.
//!
//! The broker never talks to a driver directly. A [`CameraProvider`] enumerates
//! and opens cameras; each open camera is a [`CameraDevice`] handle that pushes
//! frames and events into a [`HardwareStream`] registered at stream start.
//!
//! Implementations must not call back into the stream from
//! [`CameraDevice::set_buffer_quota`]; callbacks from `start_stream` and
//! `stop_stream` are allowed.

pub mod frame;
pub mod scripted;
#[cfg(feature = "v4l2")]
pub mod v4l2;
pub mod virtual_camera;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use frame::{DeviceId, FrameBuffer, FrameId, FrameMetadata, PixelFormat, StreamConfig};
pub use scripted::{ScriptedCamera, ScriptedProvider};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Provider;
pub use virtual_camera::VirtualCameraProvider;

#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("no such camera: {0}")]
    NoSuchCamera(String),

    #[error("camera {0} does not support {1}")]
    Unsupported(String, String),

    #[error("cannot provide {requested} buffers")]
    BufferNotAvailable { requested: u32 },

    #[error("stream is not running")]
    NotStreaming,

    #[error("device failure: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Camera control parameters that can be arbitrated between clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CameraParam {
    Brightness,
    Contrast,
    AutoWhiteBalance,
    WhiteBalanceTemperature,
    Sharpness,
    AutoExposure,
    AbsoluteExposure,
    AbsoluteFocus,
    AutoFocus,
    AbsoluteZoom,
}

impl CameraParam {
    pub const ALL: [CameraParam; 10] = [
        CameraParam::Brightness,
        CameraParam::Contrast,
        CameraParam::AutoWhiteBalance,
        CameraParam::WhiteBalanceTemperature,
        CameraParam::Sharpness,
        CameraParam::AutoExposure,
        CameraParam::AbsoluteExposure,
        CameraParam::AbsoluteFocus,
        CameraParam::AutoFocus,
        CameraParam::AbsoluteZoom,
    ];
}

/// Valid values of one parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub min: i32,
    pub max: i32,
    pub step: i32,
}

impl ParameterRange {
    /// Snap `value` into the range, aligned to `step` from `min`
    pub fn clamp(&self, value: i32) -> i32 {
        let value = value.clamp(self.min, self.max);
        if self.step > 1 {
            self.min + (value - self.min) / self.step * self.step
        } else {
            value
        }
    }
}

/// Asynchronous notifications raised by a camera device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareEvent {
    StreamStarted,
    StreamStopped,
    FrameDropped,
    Timeout,
    ParameterChanged { param: CameraParam, value: i32 },
}

/// Describes one camera as enumerated by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDescriptor {
    pub id: DeviceId,
    /// Non-empty for a logical camera backed by several physical ones
    pub physical_ids: Vec<DeviceId>,
    pub default_stream: StreamConfig,
}

impl CameraDescriptor {
    pub fn physical(id: impl Into<DeviceId>, default_stream: StreamConfig) -> Self {
        Self {
            id: id.into(),
            physical_ids: Vec::new(),
            default_stream,
        }
    }

    pub fn is_logical(&self) -> bool {
        !self.physical_ids.is_empty()
    }
}

/// Receiver of frames and events from a running camera
pub trait HardwareStream: Send + Sync {
    fn on_frame(&self, frame: FrameBuffer);
    fn on_event(&self, event: HardwareEvent);
}

/// An open camera handle
pub trait CameraDevice: Send + Sync {
    fn id(&self) -> &str;

    /// Resize the pool of buffers the device may have in flight
    fn set_buffer_quota(&self, count: u32) -> Result<(), HardwareError>;

    fn start_stream(&self, stream: Arc<dyn HardwareStream>) -> Result<(), HardwareError>;

    fn stop_stream(&self) -> Result<(), HardwareError>;

    /// Give a buffer back to the device for refilling
    fn return_buffer(&self, frame_id: FrameId);

    fn parameter_list(&self) -> Vec<CameraParam>;

    fn parameter_range(&self, param: CameraParam) -> Result<ParameterRange, HardwareError>;

    fn get_parameter(&self, param: CameraParam) -> Result<i32, HardwareError>;

    /// Apply a parameter, returning the value actually in effect
    fn set_parameter(&self, param: CameraParam, value: i32) -> Result<i32, HardwareError>;

    fn get_extended_info(&self, _key: u32) -> Result<Vec<u8>, HardwareError> {
        Err(HardwareError::Unsupported(
            self.id().to_string(),
            "extended info".into(),
        ))
    }

    fn set_extended_info(&self, _key: u32, _value: &[u8]) -> Result<(), HardwareError> {
        Err(HardwareError::Unsupported(
            self.id().to_string(),
            "extended info".into(),
        ))
    }

    /// Release the hardware; the handle is unusable afterwards
    fn close(&self);
}

/// Enumerates and opens cameras
pub trait CameraProvider: Send + Sync {
    fn cameras(&self) -> Vec<CameraDescriptor>;

    fn open(&self, id: &str, config: &StreamConfig)
        -> Result<Box<dyn CameraDevice>, HardwareError>;

    fn describe(&self, id: &str) -> Option<CameraDescriptor> {
        self.cameras().into_iter().find(|c| &*c.id == id)
    }
}
