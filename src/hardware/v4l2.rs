//! V4L2 capture devices behind the camera provider contract

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{
    CameraDescriptor, CameraDevice, CameraParam, CameraProvider, FrameBuffer, FrameId,
    FrameMetadata, HardwareError, HardwareEvent, HardwareStream, ParameterRange, PixelFormat,
    StreamConfig,
};

fn control_id(param: CameraParam) -> u32 {
    match param {
        CameraParam::Brightness => 0x0098_0900,
        CameraParam::Contrast => 0x0098_0901,
        CameraParam::AutoWhiteBalance => 0x0098_090c,
        CameraParam::WhiteBalanceTemperature => 0x0098_091a,
        CameraParam::Sharpness => 0x0098_091b,
        CameraParam::AutoExposure => 0x009a_0901,
        CameraParam::AbsoluteExposure => 0x009a_0902,
        CameraParam::AbsoluteFocus => 0x009a_090a,
        CameraParam::AutoFocus => 0x009a_090c,
        CameraParam::AbsoluteZoom => 0x009a_090d,
    }
}

fn fourcc(format: PixelFormat) -> Result<FourCC, HardwareError> {
    match format {
        PixelFormat::Mjpeg => Ok(FourCC::new(b"MJPG")),
        PixelFormat::Yuyv4 => Ok(FourCC::new(b"YUYV")),
        PixelFormat::Rgb24 => Ok(FourCC::new(b"RGB3")),
        PixelFormat::Bgr24 => Ok(FourCC::new(b"BGR3")),
        PixelFormat::Nv12 => Ok(FourCC::new(b"NV12")),
    }
}

/// Enumerates `/dev/video*` nodes that can capture
pub struct V4l2Provider {
    default_stream: StreamConfig,
}

impl V4l2Provider {
    pub fn new(default_stream: StreamConfig) -> Self {
        Self { default_stream }
    }
}

impl CameraProvider for V4l2Provider {
    fn cameras(&self) -> Vec<CameraDescriptor> {
        let mut found = Vec::new();
        for i in 0..10 {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }
            if let Ok(dev) = Device::with_path(&path) {
                if let Ok(caps) = dev.query_caps() {
                    if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                        debug!("Found capture device: {} - {}", path, caps.card);
                        found.push(CameraDescriptor::physical(path.as_str(), self.default_stream));
                    }
                }
            }
        }
        found
    }

    #[instrument(skip(self))]
    fn open(
        &self,
        id: &str,
        config: &StreamConfig,
    ) -> Result<Box<dyn CameraDevice>, HardwareError> {
        if !Path::new(id).exists() {
            return Err(HardwareError::NoSuchCamera(id.to_string()));
        }
        let device = Device::with_path(id)?;
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(HardwareError::Unsupported(id.into(), "video capture".into()));
        }

        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = fourcc(config.format)?;
        let applied = device.set_format(&fmt)?;

        Ok(Box::new(V4l2Camera {
            id: id.to_string(),
            config: *config,
            stride: row_stride(config, applied.stride),
            device: Arc::new(device),
            slots: Arc::new(Mutex::new(Slots::default())),
            worker: Mutex::new(None),
        }))
    }
}

/// Bytes per row, preferring what the driver reports
fn row_stride(config: &StreamConfig, reported: u32) -> u32 {
    if reported > 0 {
        reported
    } else {
        config.width * config.format.bytes_per_pixel()
    }
}

/// The mmap ring is requeued by the driver as soon as we copy out of it, so
/// the broker-facing buffer ids are virtual slots bounded by the quota.
#[derive(Default)]
struct Slots {
    quota: u32,
    outstanding: HashSet<FrameId>,
    next: FrameId,
}

impl Slots {
    fn take(&mut self) -> Option<FrameId> {
        if self.outstanding.len() as u32 >= self.quota.max(1) {
            return None;
        }
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        self.outstanding.insert(id);
        Some(id)
    }
}

struct Worker {
    thread: ThreadId,
    handle: JoinHandle<()>,
    running: Arc<AtomicBool>,
    stream: Arc<dyn HardwareStream>,
}

struct V4l2Camera {
    id: String,
    config: StreamConfig,
    stride: u32,
    device: Arc<Device>,
    slots: Arc<Mutex<Slots>>,
    worker: Mutex<Option<Worker>>,
}

impl CameraDevice for V4l2Camera {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_buffer_quota(&self, count: u32) -> Result<(), HardwareError> {
        self.slots.lock().quota = count;
        Ok(())
    }

    fn start_stream(&self, stream: Arc<dyn HardwareStream>) -> Result<(), HardwareError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(HardwareError::Device(format!("{} is already streaming", self.id)));
        }

        let buffer_count = self.slots.lock().quota.max(2);
        let mut mmap = MmapStream::with_buffers(&self.device, Type::VideoCapture, buffer_count)?;
        let running = Arc::new(AtomicBool::new(true));
        let sequence = AtomicU64::new(0);

        let stride = self.stride;
        let (id, config, slots, sink, flag) = (
            self.id.clone(),
            self.config,
            self.slots.clone(),
            stream.clone(),
            running.clone(),
        );
        let handle = thread::Builder::new()
            .name(format!("v4l2-{}", id))
            .spawn(move || {
                let device_id: super::DeviceId = id.as_str().into();
                while flag.load(Ordering::Acquire) {
                    let (buf, meta) = match mmap.next() {
                        Ok(next) => next,
                        Err(e) => {
                            error!("{}: dequeue failed: {}", id, e);
                            sink.on_event(HardwareEvent::Timeout);
                            thread::sleep(Duration::from_millis(10));
                            continue;
                        }
                    };
                    let Some(frame_id) = slots.lock().take() else {
                        sink.on_event(HardwareEvent::FrameDropped);
                        continue;
                    };
                    let sequence = sequence.fetch_add(1, Ordering::Relaxed) + 1;
                    sink.on_frame(FrameBuffer {
                        device_id: device_id.clone(),
                        frame_id,
                        timestamp: Duration::from_secs(meta.timestamp.sec as u64)
                            + Duration::from_micros(meta.timestamp.usec as u64),
                        data: Bytes::copy_from_slice(buf),
                        meta: Arc::new(FrameMetadata {
                            sequence,
                            width: config.width,
                            height: config.height,
                            stride,
                            format: config.format,
                        }),
                    });
                }
            })?;

        *worker = Some(Worker {
            thread: handle.thread().id(),
            handle,
            running,
            stream: stream.clone(),
        });
        drop(worker);

        info!("{}: capture stream started with {} buffers", self.id, buffer_count);
        stream.on_event(HardwareEvent::StreamStarted);
        Ok(())
    }

    fn stop_stream(&self) -> Result<(), HardwareError> {
        let Some(worker) = self.worker.lock().take() else {
            return Err(HardwareError::NotStreaming);
        };
        worker.running.store(false, Ordering::Release);
        if worker.thread != thread::current().id() && worker.handle.join().is_err() {
            warn!("{}: capture thread panicked", self.id);
        }
        worker.stream.on_event(HardwareEvent::StreamStopped);
        Ok(())
    }

    fn return_buffer(&self, frame_id: FrameId) {
        self.slots.lock().outstanding.remove(&frame_id);
    }

    fn parameter_list(&self) -> Vec<CameraParam> {
        CameraParam::ALL
            .into_iter()
            .filter(|p| self.device.control(control_id(*p)).is_ok())
            .collect()
    }

    fn parameter_range(&self, param: CameraParam) -> Result<ParameterRange, HardwareError> {
        let id = control_id(param);
        let description = self
            .device
            .query_controls()?
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| HardwareError::Unsupported(self.id.clone(), format!("{param:?}")))?;
        Ok(ParameterRange {
            min: description.minimum as i32,
            max: description.maximum as i32,
            step: description.step as i32,
        })
    }

    fn get_parameter(&self, param: CameraParam) -> Result<i32, HardwareError> {
        match self.device.control(control_id(param))?.value {
            Value::Integer(v) => Ok(v as i32),
            Value::Boolean(b) => Ok(i32::from(b)),
            _ => Err(HardwareError::Unsupported(self.id.clone(), format!("{param:?}"))),
        }
    }

    fn set_parameter(&self, param: CameraParam, value: i32) -> Result<i32, HardwareError> {
        self.device.set_control(Control {
            id: control_id(param),
            value: Value::Integer(i64::from(value)),
        })?;
        self.get_parameter(param)
    }

    fn close(&self) {
        if self.worker.lock().is_some() {
            let _ = self.stop_stream();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_accounts_for_pixel_size() {
        let config = StreamConfig {
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Yuyv4,
        };
        assert_eq!(row_stride(&config, 0), 1280);
        // Drivers may pad rows
        assert_eq!(row_stride(&config, 1344), 1344);
    }
}
