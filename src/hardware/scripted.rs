//! Scriptable camera provider
//!
//! Frames and events are injected by hand, and every call the broker makes is
//! recorded, so tests can drive exact interleavings without timing games.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{
    CameraDescriptor, CameraDevice, CameraParam, CameraProvider, DeviceId, FrameBuffer, FrameId,
    FrameMetadata, HardwareError, HardwareEvent, HardwareStream, ParameterRange, StreamConfig,
};

const PARAM_RANGE: ParameterRange = ParameterRange {
    min: 0,
    max: 255,
    step: 1,
};

#[derive(Default)]
pub struct ScriptedProvider {
    cameras: Mutex<BTreeMap<DeviceId, Arc<ScriptedCamera>>>,
    logical: Mutex<Vec<CameraDescriptor>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cameras(ids: &[&str]) -> Self {
        let provider = Self::new();
        for id in ids {
            provider.add_camera(id);
        }
        provider
    }

    pub fn add_camera(&self, id: &str) -> Arc<ScriptedCamera> {
        let camera = Arc::new(ScriptedCamera::new(id));
        self.cameras.lock().insert(camera.id.clone(), camera.clone());
        camera
    }

    /// Register a logical camera made of already added physical ones
    pub fn add_logical(&self, id: &str, physical_ids: &[&str]) {
        self.logical.lock().push(CameraDescriptor {
            id: id.into(),
            physical_ids: physical_ids.iter().map(|p| DeviceId::from(*p)).collect(),
            default_stream: StreamConfig::default(),
        });
    }

    pub fn camera(&self, id: &str) -> Option<Arc<ScriptedCamera>> {
        self.cameras.lock().get(id).cloned()
    }
}

impl CameraProvider for ScriptedProvider {
    fn cameras(&self) -> Vec<CameraDescriptor> {
        let mut list: Vec<_> = self
            .cameras
            .lock()
            .values()
            .map(|c| CameraDescriptor::physical(c.id.clone(), c.config))
            .collect();
        list.extend(self.logical.lock().iter().cloned());
        list
    }

    fn open(
        &self,
        id: &str,
        config: &StreamConfig,
    ) -> Result<Box<dyn CameraDevice>, HardwareError> {
        let camera = self
            .camera(id)
            .ok_or_else(|| HardwareError::NoSuchCamera(id.to_string()))?;
        if camera.fail_open.load(Ordering::Acquire) {
            return Err(HardwareError::Device(format!("{id} refused to open")));
        }
        {
            let mut state = camera.state.lock();
            state.open = true;
            state.opened_with = Some(*config);
            state.open_count += 1;
        }
        Ok(Box::new(ScriptedHandle(camera)))
    }
}

#[derive(Default)]
struct ScriptedState {
    stream: Option<Arc<dyn HardwareStream>>,
    open: bool,
    open_count: u32,
    opened_with: Option<StreamConfig>,
    quota: u32,
    quota_history: Vec<u32>,
    returned: Vec<FrameId>,
    params: BTreeMap<CameraParam, i32>,
    extended: HashMap<u32, Vec<u8>>,
}

/// One scripted camera; clone the `Arc` to keep driving it from a test
pub struct ScriptedCamera {
    id: DeviceId,
    config: StreamConfig,
    state: Mutex<ScriptedState>,
    fail_open: AtomicBool,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    quota_limit: AtomicU32,
    sequence: AtomicU64,
}

impl ScriptedCamera {
    fn new(id: &str) -> Self {
        Self {
            id: id.into(),
            config: StreamConfig::default(),
            state: Mutex::new(ScriptedState::default()),
            fail_open: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            quota_limit: AtomicU32::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Push one frame into the running stream; false when not streaming
    pub fn emit_frame(&self, frame_id: FrameId, timestamp: Duration) -> bool {
        let Some(stream) = self.state.lock().stream.clone() else {
            return false;
        };
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        stream.on_frame(FrameBuffer {
            device_id: self.id.clone(),
            frame_id,
            timestamp,
            data: Bytes::from(vec![(sequence % 256) as u8; 16]),
            meta: Arc::new(FrameMetadata {
                sequence,
                width: 4,
                height: 4,
                stride: 4,
                format: self.config.format,
            }),
        });
        true
    }

    /// Raise an event as if the hardware had; false when no stream is registered.
    /// `StreamStopped` also unregisters the stream.
    pub fn emit_event(&self, event: HardwareEvent) -> bool {
        let stream = {
            let mut state = self.state.lock();
            if event == HardwareEvent::StreamStopped {
                state.stream.take()
            } else {
                state.stream.clone()
            }
        };
        match stream {
            Some(stream) => {
                stream.on_event(event);
                true
            }
            None => false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().stream.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn open_count(&self) -> u32 {
        self.state.lock().open_count
    }

    pub fn opened_with(&self) -> Option<StreamConfig> {
        self.state.lock().opened_with
    }

    pub fn quota(&self) -> u32 {
        self.state.lock().quota
    }

    pub fn quota_history(&self) -> Vec<u32> {
        self.state.lock().quota_history.clone()
    }

    pub fn returned_buffers(&self) -> Vec<FrameId> {
        self.state.lock().returned.clone()
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Release);
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Release);
    }

    pub fn fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::Release);
    }

    /// Largest quota the camera will grant; 0 lifts the limit
    pub fn limit_quota(&self, limit: u32) {
        self.quota_limit.store(limit, Ordering::Release);
    }
}

struct ScriptedHandle(Arc<ScriptedCamera>);

impl CameraDevice for ScriptedHandle {
    fn id(&self) -> &str {
        &self.0.id
    }

    fn set_buffer_quota(&self, count: u32) -> Result<(), HardwareError> {
        let limit = self.0.quota_limit.load(Ordering::Acquire);
        if limit > 0 && count > limit {
            return Err(HardwareError::BufferNotAvailable { requested: count });
        }
        let mut state = self.0.state.lock();
        state.quota = count;
        state.quota_history.push(count);
        Ok(())
    }

    fn start_stream(&self, stream: Arc<dyn HardwareStream>) -> Result<(), HardwareError> {
        if self.0.fail_start.load(Ordering::Acquire) {
            return Err(HardwareError::Device(format!("{} failed to start", self.0.id)));
        }
        self.0.state.lock().stream = Some(stream.clone());
        stream.on_event(HardwareEvent::StreamStarted);
        Ok(())
    }

    fn stop_stream(&self) -> Result<(), HardwareError> {
        if self.0.fail_stop.load(Ordering::Acquire) {
            return Err(HardwareError::Device(format!("{} failed to stop", self.0.id)));
        }
        let stream = self.0.state.lock().stream.take();
        match stream {
            Some(stream) => {
                stream.on_event(HardwareEvent::StreamStopped);
                Ok(())
            }
            None => Err(HardwareError::NotStreaming),
        }
    }

    fn return_buffer(&self, frame_id: FrameId) {
        self.0.state.lock().returned.push(frame_id);
    }

    fn parameter_list(&self) -> Vec<CameraParam> {
        CameraParam::ALL.to_vec()
    }

    fn parameter_range(&self, _param: CameraParam) -> Result<ParameterRange, HardwareError> {
        Ok(PARAM_RANGE)
    }

    fn get_parameter(&self, param: CameraParam) -> Result<i32, HardwareError> {
        Ok(self.0.state.lock().params.get(&param).copied().unwrap_or(0))
    }

    fn set_parameter(&self, param: CameraParam, value: i32) -> Result<i32, HardwareError> {
        let value = PARAM_RANGE.clamp(value);
        self.0.state.lock().params.insert(param, value);
        Ok(value)
    }

    fn get_extended_info(&self, key: u32) -> Result<Vec<u8>, HardwareError> {
        Ok(self
            .0
            .state
            .lock()
            .extended
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    fn set_extended_info(&self, key: u32, value: &[u8]) -> Result<(), HardwareError> {
        self.0.state.lock().extended.insert(key, value.to_vec());
        Ok(())
    }

    fn close(&self) {
        let mut state = self.0.state.lock();
        state.open = false;
        state.stream = None;
    }
}
