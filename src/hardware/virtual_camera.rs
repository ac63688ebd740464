//! Synthetic cameras that emit patterned frames at a fixed rate
//!
//! Each camera fills buffers from a quota-bounded pool; when every buffer is
//! out with clients the tick is skipped, just like a real sensor starving for
//! buffers.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use bytes::Bytes;
use crossbeam::channel::{self, select, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    CameraDescriptor, CameraDevice, CameraParam, CameraProvider, DeviceId, FrameBuffer, FrameId,
    FrameMetadata, HardwareError, HardwareEvent, HardwareStream, ParameterRange, StreamConfig,
};
use crate::HardwareConfig;

/// Provider backed by the `[hardware]` section of the configuration
pub struct VirtualCameraProvider {
    cameras: Vec<CameraDescriptor>,
}

impl VirtualCameraProvider {
    pub fn new(config: &HardwareConfig) -> Self {
        let mut cameras: Vec<_> = config
            .cameras
            .iter()
            .map(|c| CameraDescriptor::physical(c.id.as_str(), c.stream))
            .collect();
        for logical in &config.logical_cameras {
            let default_stream = config
                .cameras
                .iter()
                .find(|c| logical.physical_ids.first() == Some(&c.id))
                .map(|c| c.stream)
                .unwrap_or_default();
            cameras.push(CameraDescriptor {
                id: logical.id.as_str().into(),
                physical_ids: logical
                    .physical_ids
                    .iter()
                    .map(|p| DeviceId::from(p.as_str()))
                    .collect(),
                default_stream,
            });
        }
        Self { cameras }
    }
}

impl CameraProvider for VirtualCameraProvider {
    fn cameras(&self) -> Vec<CameraDescriptor> {
        self.cameras.clone()
    }

    fn open(
        &self,
        id: &str,
        config: &StreamConfig,
    ) -> Result<Box<dyn CameraDevice>, HardwareError> {
        let descriptor = self
            .cameras
            .iter()
            .find(|c| &*c.id == id && !c.is_logical())
            .ok_or_else(|| HardwareError::NoSuchCamera(id.to_string()))?;
        info!("Opening virtual camera {} ({:?})", id, config);
        Ok(Box::new(VirtualCamera::new(descriptor.id.clone(), *config)))
    }
}

fn range_of(param: CameraParam) -> ParameterRange {
    match param {
        CameraParam::AutoWhiteBalance | CameraParam::AutoExposure | CameraParam::AutoFocus => {
            ParameterRange {
                min: 0,
                max: 1,
                step: 1,
            }
        }
        CameraParam::WhiteBalanceTemperature => ParameterRange {
            min: 2800,
            max: 6500,
            step: 100,
        },
        CameraParam::AbsoluteExposure => ParameterRange {
            min: 1,
            max: 10_000,
            step: 1,
        },
        _ => ParameterRange {
            min: 0,
            max: 255,
            step: 1,
        },
    }
}

/// Buffers the camera may fill, bounded by the negotiated quota
#[derive(Default)]
struct BufferPool {
    quota: u32,
    free: Vec<FrameId>,
    outstanding: HashSet<FrameId>,
    next_id: FrameId,
}

impl BufferPool {
    fn allotted(&self) -> u32 {
        (self.free.len() + self.outstanding.len()) as u32
    }

    fn resize(&mut self, quota: u32) {
        self.quota = quota;
        while self.allotted() < quota {
            self.free.push(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
        }
        while self.allotted() > quota && self.free.pop().is_some() {}
    }

    fn take(&mut self) -> Option<FrameId> {
        let id = self.free.pop()?;
        self.outstanding.insert(id);
        Some(id)
    }

    fn give_back(&mut self, id: FrameId) -> bool {
        if !self.outstanding.remove(&id) {
            return false;
        }
        // Buffers above a shrunk quota are retired instead of recycled
        if self.allotted() < self.quota {
            self.free.push(id);
        }
        true
    }
}

struct Worker {
    thread: ThreadId,
    handle: JoinHandle<()>,
    stop: Sender<()>,
}

struct Shared {
    id: DeviceId,
    config: StreamConfig,
    pool: Mutex<BufferPool>,
    params: Mutex<BTreeMap<CameraParam, i32>>,
    sequence: AtomicU64,
}

impl Shared {
    fn produce(&self, started: Instant, stream: &dyn HardwareStream) {
        let Some(frame_id) = self.pool.lock().take() else {
            debug!("{}: no free buffer, skipping tick", self.id);
            return;
        };
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let data = vec![(sequence % 256) as u8; self.config.frame_size()];
        stream.on_frame(FrameBuffer {
            device_id: self.id.clone(),
            frame_id,
            timestamp: started.elapsed(),
            data: Bytes::from(data),
            meta: Arc::new(FrameMetadata {
                sequence,
                width: self.config.width,
                height: self.config.height,
                stride: self.config.width * self.config.format.bytes_per_pixel(),
                format: self.config.format,
            }),
        });
    }
}

/// One synthetic camera
pub struct VirtualCamera {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    stream: Mutex<Option<Arc<dyn HardwareStream>>>,
}

impl VirtualCamera {
    pub fn new(id: DeviceId, config: StreamConfig) -> Self {
        let mut pool = BufferPool::default();
        pool.resize(1);
        Self {
            shared: Arc::new(Shared {
                id,
                config,
                pool: Mutex::new(pool),
                params: Mutex::new(BTreeMap::new()),
                sequence: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
            stream: Mutex::new(None),
        }
    }
}

impl CameraDevice for VirtualCamera {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn set_buffer_quota(&self, count: u32) -> Result<(), HardwareError> {
        if count == 0 {
            return Err(HardwareError::BufferNotAvailable { requested: count });
        }
        self.shared.pool.lock().resize(count);
        debug!("{}: buffer quota set to {}", self.shared.id, count);
        Ok(())
    }

    fn start_stream(&self, stream: Arc<dyn HardwareStream>) -> Result<(), HardwareError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(HardwareError::Device(format!(
                "{} is already streaming",
                self.shared.id
            )));
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let shared = self.shared.clone();
        let sink = stream.clone();
        let interval = shared.config.frame_interval();
        let handle = thread::Builder::new()
            .name(format!("vcam-{}", shared.id))
            .spawn(move || {
                let started = Instant::now();
                let ticker = channel::tick(interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => shared.produce(started, sink.as_ref()),
                    }
                }
            })?;

        *worker = Some(Worker {
            thread: handle.thread().id(),
            handle,
            stop: stop_tx,
        });
        *self.stream.lock() = Some(stream.clone());
        drop(worker);

        info!(
            "{}: streaming at {} fps",
            self.shared.id, self.shared.config.fps
        );
        stream.on_event(HardwareEvent::StreamStarted);
        Ok(())
    }

    fn stop_stream(&self) -> Result<(), HardwareError> {
        let Some(worker) = self.worker.lock().take() else {
            return Err(HardwareError::NotStreaming);
        };
        let _ = worker.stop.send(());
        if worker.thread == thread::current().id() {
            // Stopped from inside a frame callback; the loop exits on its own
            debug!("{}: stop requested from capture thread", self.shared.id);
        } else if worker.handle.join().is_err() {
            warn!("{}: capture thread panicked", self.shared.id);
        }

        if let Some(stream) = self.stream.lock().take() {
            stream.on_event(HardwareEvent::StreamStopped);
        }
        Ok(())
    }

    fn return_buffer(&self, frame_id: FrameId) {
        if !self.shared.pool.lock().give_back(frame_id) {
            warn!(
                "{}: returned buffer {} was not outstanding",
                self.shared.id, frame_id
            );
        }
    }

    fn parameter_list(&self) -> Vec<CameraParam> {
        CameraParam::ALL.to_vec()
    }

    fn parameter_range(&self, param: CameraParam) -> Result<ParameterRange, HardwareError> {
        Ok(range_of(param))
    }

    fn get_parameter(&self, param: CameraParam) -> Result<i32, HardwareError> {
        let range = range_of(param);
        Ok(self
            .shared
            .params
            .lock()
            .get(&param)
            .copied()
            .unwrap_or(range.min))
    }

    fn set_parameter(&self, param: CameraParam, value: i32) -> Result<i32, HardwareError> {
        let applied = range_of(param).clamp(value);
        self.shared.params.lock().insert(param, applied);
        Ok(applied)
    }

    fn close(&self) {
        if self.worker.lock().is_some() {
            let _ = self.stop_stream();
        }
        info!("Closed virtual camera {}", self.shared.id);
    }
}
