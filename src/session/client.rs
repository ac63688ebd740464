//! Client-visible camera handle.
//!
//! A physical client wraps one device session and forwards each accepted frame
//! straight to its sink from the delivery thread. A logical client spans
//! several device sessions and runs a capture worker that requests one frame
//! from every device per cycle, waits for all of them, and hands the set to the
//! sink in device order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, instrument, warn};

use super::device::DeviceSession;
use super::sink::{FrameSink, StreamEvent};
use super::StreamState;
use crate::broker::Registry;
use crate::error::{BrokerError, Result};
use crate::hardware::{CameraParam, DeviceId, FrameBuffer, FrameId, ParameterRange};
use crate::ClientConfig;

pub type ClientId = u64;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Buffers the client may hold per device before frames are dropped
    pub frames_in_flight: u32,
    /// Bound on one aggregation cycle of a logical client
    pub frame_timeout: Duration,
}

impl From<&ClientConfig> for ClientOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            frames_in_flight: config.default_frames_in_flight.max(1),
            frame_timeout: config.frame_timeout(),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

#[derive(Default)]
struct ClientInner {
    state: StreamState,
    sink: Option<Arc<dyn FrameSink>>,
    /// Frames the caller has not returned yet, per device
    held: HashMap<DeviceId, Vec<FrameBuffer>>,
    /// Frames gathered in the current aggregation cycle; also counted in `held`
    round: Vec<FrameBuffer>,
    last_delivered: HashMap<DeviceId, Duration>,
    worker: Option<JoinHandle<()>>,
}

impl ClientInner {
    fn held_count(&self, device_id: &DeviceId) -> usize {
        self.held.get(device_id).map_or(0, Vec::len)
    }

    fn forget(&mut self, device_id: &DeviceId, frame_id: FrameId) -> bool {
        let Some(frames) = self.held.get_mut(device_id) else {
            return false;
        };
        match frames.iter().position(|f| f.frame_id == frame_id) {
            Some(i) => {
                frames.swap_remove(i);
                true
            }
            None => false,
        }
    }

    /// Drop the unfinished cycle, yielding the frames to hand back
    fn abandon_round(&mut self) -> Vec<FrameBuffer> {
        let round = std::mem::take(&mut self.round);
        for frame in &round {
            self.forget(&frame.device_id, frame.frame_id);
        }
        round
    }
}

/// State shared with the capture worker
struct ClientShared {
    inner: Mutex<ClientInner>,
    frames_ready: Condvar,
    frames_allowed: AtomicU32,
}

pub struct ClientSession {
    id: ClientId,
    devices: Vec<(DeviceId, Weak<DeviceSession>)>,
    shared: Arc<ClientShared>,
    frame_timeout: Duration,
    registry: Option<Weak<Registry>>,
    closed: AtomicBool,
    weak_self: Weak<ClientSession>,
}

impl ClientSession {
    /// Build a client over `devices`. The caller subscribes it to each one.
    pub fn new(
        devices: &[Arc<DeviceSession>],
        options: ClientOptions,
        registry: Option<Weak<Registry>>,
    ) -> Arc<Self> {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let devices = devices
            .iter()
            .map(|d| (d.id().clone(), Arc::downgrade(d)))
            .collect();
        Arc::new_cyclic(|weak_self| Self {
            id,
            devices,
            shared: Arc::new(ClientShared {
                inner: Mutex::new(ClientInner::default()),
                frames_ready: Condvar::new(),
                frames_allowed: AtomicU32::new(options.frames_in_flight.max(1)),
            }),
            frame_timeout: options.frame_timeout,
            registry,
            closed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn is_logical(&self) -> bool {
        self.devices.len() > 1
    }

    pub fn stream_state(&self) -> StreamState {
        self.shared.inner.lock().state
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_state() == StreamState::Running
    }

    pub fn frames_allowed(&self) -> u32 {
        self.shared.frames_allowed.load(Ordering::Acquire)
    }

    /// Buffers currently held across all devices
    pub fn held_count(&self) -> usize {
        self.shared.inner.lock().held.values().map(Vec::len).sum()
    }

    fn device(&self, device_id: &DeviceId) -> Option<Arc<DeviceSession>> {
        self.devices
            .iter()
            .find(|(id, _)| id == device_id)
            .and_then(|(_, weak)| weak.upgrade())
    }

    fn live_devices(&self) -> Vec<Arc<DeviceSession>> {
        self.devices
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    fn first_device(&self) -> Option<Arc<DeviceSession>> {
        self.devices.first().and_then(|(_, weak)| weak.upgrade())
    }

    fn request_from(&self, device_id: &DeviceId, last_timestamp: Option<Duration>) {
        if let Some(device) = self.device(device_id) {
            device.request_frame(self.id, self.weak_self.clone(), last_timestamp);
        }
    }

    fn release_to(&self, device_id: &DeviceId, frame_id: FrameId) {
        if let Some(device) = self.device(device_id) {
            device.done_with_frame(self.id, frame_id);
        }
    }

    /// Offer a frame from one of this client's devices. Returns whether the
    /// client took a reference on it.
    pub fn deliver_frame(&self, frame: &FrameBuffer) -> bool {
        let allowed = self.frames_allowed() as usize;
        let mut inner = self.shared.inner.lock();
        if inner.state != StreamState::Running {
            return false;
        }

        if inner.held_count(&frame.device_id) >= allowed {
            let sink = inner.sink.clone();
            let last = inner.last_delivered.get(&frame.device_id).copied();
            drop(inner);
            debug!(
                "Client {}: holding {} buffers from {}, dropping frame {}",
                self.id, allowed, frame.device_id, frame.frame_id
            );
            counter!("argus_frames_dropped_total", "device" => frame.device_id.to_string())
                .increment(1);
            if let Some(sink) = sink {
                sink.notify(StreamEvent::FrameDropped {
                    device_id: frame.device_id.clone(),
                });
            }
            self.request_from(&frame.device_id, last);
            return false;
        }

        if self.is_logical() {
            if inner.round.iter().any(|f| f.device_id == frame.device_id) {
                debug!(
                    "Client {}: already has a frame from {} this cycle",
                    self.id, frame.device_id
                );
                return false;
            }
            inner
                .held
                .entry(frame.device_id.clone())
                .or_default()
                .push(frame.clone());
            inner.round.push(frame.clone());
            if inner.round.len() == self.devices.len() {
                self.shared.frames_ready.notify_all();
            }
            return true;
        }

        inner
            .held
            .entry(frame.device_id.clone())
            .or_default()
            .push(frame.clone());
        inner
            .last_delivered
            .insert(frame.device_id.clone(), frame.timestamp);
        let sink = inner.sink.clone();
        drop(inner);

        if let Some(sink) = sink {
            sink.deliver_frames(vec![frame.clone()]);
        }
        self.request_from(&frame.device_id, Some(frame.timestamp));
        true
    }

    /// Event raised by one of this client's devices
    pub fn notify_event(&self, event: StreamEvent) {
        let (sink, unexpected_stop, abandoned) = {
            let mut inner = self.shared.inner.lock();
            match event {
                StreamEvent::StreamStopped => match inner.state {
                    StreamState::Running => {
                        inner.state = StreamState::Stopped;
                        self.shared.frames_ready.notify_all();
                        (inner.sink.clone(), true, inner.abandon_round())
                    }
                    // Our own stop already told the sink
                    StreamState::Stopping | StreamState::Stopped => return,
                },
                _ => (inner.sink.clone(), false, Vec::new()),
            }
        };

        if unexpected_stop {
            warn!("Client {}: stream stopped underneath the client", self.id);
            for frame in abandoned {
                self.release_to(&frame.device_id, frame.frame_id);
            }
            for device in self.live_devices() {
                device.client_stream_ending(self.id);
            }
        }
        if let Some(sink) = sink {
            sink.notify(event);
        }
    }

    /// Start streaming into `sink`
    #[instrument(skip(self, sink), fields(client = self.id))]
    pub fn start_stream(&self, sink: Arc<dyn FrameSink>) -> Result<()> {
        let stale_worker = {
            let mut inner = self.shared.inner.lock();
            if inner.state != StreamState::Stopped {
                return Err(BrokerError::StreamAlreadyRunning);
            }
            inner.worker.take()
        };
        // A worker left over from an unexpected stop must exit before the
        // state flips back to Running
        if let Some(worker) = stale_worker {
            join_worker(worker);
        }
        let abandoned = {
            let mut inner = self.shared.inner.lock();
            if inner.state != StreamState::Stopped {
                return Err(BrokerError::StreamAlreadyRunning);
            }
            inner.state = StreamState::Running;
            inner.sink = Some(sink);
            inner.abandon_round()
        };
        for frame in abandoned {
            self.release_to(&frame.device_id, frame.frame_id);
        }

        let mut started = Vec::new();
        for device in self.live_devices() {
            if let Err(e) = device.client_stream_starting() {
                error!("Client {}: {} failed to start: {}", self.id, device.id(), e);
                self.roll_back_start(&started);
                return Err(e);
            }
            started.push(device);
        }

        if self.is_logical() {
            match self.spawn_worker() {
                Ok(worker) => self.shared.inner.lock().worker = Some(worker),
                Err(e) => {
                    error!("Client {}: cannot spawn capture worker: {}", self.id, e);
                    self.roll_back_start(&started);
                    return Err(e.into());
                }
            }
        } else {
            for device in &started {
                device.request_frame(self.id, self.weak_self.clone(), None);
            }
        }
        info!("Client {}: stream started", self.id);
        Ok(())
    }

    fn roll_back_start(&self, started: &[Arc<DeviceSession>]) {
        {
            let mut inner = self.shared.inner.lock();
            inner.state = StreamState::Stopped;
            inner.sink = None;
        }
        for device in started {
            device.client_stream_ending(self.id);
        }
    }

    fn spawn_worker(&self) -> std::io::Result<JoinHandle<()>> {
        let worker = CaptureWorker {
            client_id: self.id,
            client: self.weak_self.clone(),
            devices: self.devices.clone(),
            shared: self.shared.clone(),
            timeout: self.frame_timeout,
            last_delivered: HashMap::new(),
        };
        thread::Builder::new()
            .name(format!("argus-client-{}", self.id))
            .spawn(move || worker.run())
    }

    /// Stop streaming. Stopping a client that is not streaming does nothing.
    #[instrument(skip(self), fields(client = self.id))]
    pub fn stop_stream(&self) {
        let (was_running, sink, worker) = {
            let mut inner = self.shared.inner.lock();
            let was_running = inner.state == StreamState::Running;
            if was_running {
                inner.state = StreamState::Stopping;
            }
            (was_running, inner.sink.clone(), inner.worker.take())
        };

        if was_running {
            self.shared.frames_ready.notify_all();
            if let Some(sink) = &sink {
                sink.notify(StreamEvent::StreamStopped);
            }
            for device in self.live_devices() {
                device.client_stream_ending(self.id);
            }
        }
        if let Some(worker) = worker {
            join_worker(worker);
        }

        let abandoned = {
            let mut inner = self.shared.inner.lock();
            inner.state = StreamState::Stopped;
            inner.abandon_round()
        };
        for frame in abandoned {
            self.release_to(&frame.device_id, frame.frame_id);
        }
        if was_running {
            info!("Client {}: stream stopped", self.id);
        }
    }

    /// Hand a buffer back. Frame ids are only unique per device, so logical
    /// clients should prefer [`ClientSession::done_with_frames`].
    pub fn done_with_frame(&self, frame_id: FrameId) -> Result<()> {
        let device_id = {
            let mut inner = self.shared.inner.lock();
            let device_id = inner
                .held
                .iter()
                .find(|(_, frames)| frames.iter().any(|f| f.frame_id == frame_id))
                .map(|(id, _)| id.clone());
            if let Some(id) = &device_id {
                inner.forget(id, frame_id);
            }
            device_id
        };

        match device_id {
            Some(device_id) => {
                self.release_to(&device_id, frame_id);
                Ok(())
            }
            None => Err(BrokerError::InvalidArg(format!(
                "frame {frame_id} is not held by client {}",
                self.id
            ))),
        }
    }

    /// Hand back a set of frames, typically one aggregated delivery
    pub fn done_with_frames(&self, frames: &[FrameBuffer]) -> Result<()> {
        let mut unknown = None;
        for frame in frames {
            let held = self
                .shared
                .inner
                .lock()
                .forget(&frame.device_id, frame.frame_id);
            if held {
                self.release_to(&frame.device_id, frame.frame_id);
            } else {
                unknown = Some(frame.frame_id);
            }
        }
        match unknown {
            Some(frame_id) => Err(BrokerError::InvalidArg(format!(
                "frame {frame_id} is not held by client {}",
                self.id
            ))),
            None => Ok(()),
        }
    }

    /// Change how many buffers this client may hold per device. The new
    /// quota is applied to every device or to none.
    pub fn set_max_frames_in_flight(&self, frames: u32) -> Result<()> {
        if frames == 0 {
            return Err(BrokerError::InvalidArg(
                "frames in flight must be at least 1".into(),
            ));
        }
        let previous = self.frames_allowed();
        let mut changed: Vec<Arc<DeviceSession>> = Vec::new();
        for device in self.live_devices() {
            if let Err(e) = device.change_client_quota(self.id, frames) {
                for device in &changed {
                    if let Err(e) = device.change_client_quota(self.id, previous) {
                        warn!(
                            "Client {}: could not restore quota on {}: {}",
                            self.id,
                            device.id(),
                            e
                        );
                    }
                }
                return Err(e);
            }
            changed.push(device);
        }
        self.shared.frames_allowed.store(frames, Ordering::Release);
        debug!("Client {}: {} frames in flight", self.id, frames);
        Ok(())
    }

    /// The device behind a physical client; `None` once it is gone
    fn arbitrated_device(&self) -> Result<Option<Arc<DeviceSession>>> {
        if self.is_logical() {
            return Err(BrokerError::InvalidArg(
                "master arbitration is per physical camera".into(),
            ));
        }
        Ok(self.first_device())
    }

    pub fn set_master(&self) -> Result<()> {
        match self.arbitrated_device()? {
            Some(device) => device.set_master(self.id, &self.weak_self),
            None => Ok(()),
        }
    }

    pub fn force_master(&self) -> Result<()> {
        match self.arbitrated_device()? {
            Some(device) => device.force_master(self.id, &self.weak_self),
            None => Ok(()),
        }
    }

    pub fn unset_master(&self) -> Result<()> {
        match self.arbitrated_device()? {
            Some(device) => device.unset_master(self.id),
            None => Ok(()),
        }
    }

    pub fn is_master(&self) -> bool {
        !self.is_logical()
            && self
                .first_device()
                .is_some_and(|device| device.is_master(self.id))
    }

    /// Returns the value the hardware settled on
    pub fn set_parameter(&self, param: CameraParam, value: i32) -> Result<i32> {
        match self.arbitrated_device()? {
            Some(device) => device.set_parameter(self.id, param, value),
            None => Ok(value),
        }
    }

    pub fn get_parameter(&self, param: CameraParam) -> Result<i32> {
        self.first_device()
            .ok_or_else(|| self.gone())?
            .get_parameter(param)
    }

    pub fn parameter_range(&self, param: CameraParam) -> Result<ParameterRange> {
        self.first_device()
            .ok_or_else(|| self.gone())?
            .parameter_range(param)
    }

    pub fn parameter_list(&self) -> Vec<CameraParam> {
        self.first_device()
            .map(|device| device.parameter_list())
            .unwrap_or_default()
    }

    pub fn get_extended_info(&self, key: u32) -> Result<Vec<u8>> {
        self.first_device()
            .ok_or_else(|| self.gone())?
            .get_extended_info(key)
    }

    pub fn set_extended_info(&self, key: u32, value: &[u8]) -> Result<()> {
        match self.arbitrated_device()? {
            Some(device) => device.set_extended_info(self.id, key, value),
            None => Ok(()),
        }
    }

    fn gone(&self) -> BrokerError {
        let id = self
            .devices
            .first()
            .map(|(id, _)| id.to_string())
            .unwrap_or_default();
        BrokerError::NotFound(id)
    }

    /// Tear the client down and let the broker retire devices nobody uses
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.teardown();
        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.reap(&self.device_ids());
        }
    }

    /// Tear down without touching the broker registry
    pub(crate) fn detach(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.teardown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn teardown(&self) {
        self.stop_stream();
        let held = {
            let mut inner = self.shared.inner.lock();
            inner.round.clear();
            inner.sink = None;
            std::mem::take(&mut inner.held)
        };
        for (device_id, frames) in held {
            for frame in frames {
                self.release_to(&device_id, frame.frame_id);
            }
        }
        for device in self.live_devices() {
            device.unsubscribe(self.id);
        }
        debug!("Client {}: closed", self.id);
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn join_worker(worker: JoinHandle<()>) {
    if worker.thread().id() == thread::current().id() {
        return;
    }
    if worker.join().is_err() {
        error!("Capture worker panicked");
    }
}

/// Aggregation loop of a logical client
struct CaptureWorker {
    client_id: ClientId,
    client: Weak<ClientSession>,
    devices: Vec<(DeviceId, Weak<DeviceSession>)>,
    shared: Arc<ClientShared>,
    timeout: Duration,
    last_delivered: HashMap<DeviceId, Duration>,
}

impl CaptureWorker {
    fn run(mut self) {
        debug!("Client {}: capture worker running", self.client_id);
        loop {
            let mut expected = 0;
            for (device_id, weak) in &self.devices {
                if let Some(device) = weak.upgrade() {
                    device.request_frame(
                        self.client_id,
                        self.client.clone(),
                        self.last_delivered.get(device_id).copied(),
                    );
                    expected += 1;
                }
            }
            if expected == 0 {
                warn!("Client {}: every device is gone", self.client_id);
                break;
            }

            // No deadline when the timeout is too large to represent
            let deadline = Instant::now().checked_add(self.timeout);
            let mut inner = self.shared.inner.lock();
            while inner.state == StreamState::Running && inner.round.len() < expected {
                match deadline {
                    Some(deadline) => {
                        if self
                            .shared
                            .frames_ready
                            .wait_until(&mut inner, deadline)
                            .timed_out()
                        {
                            break;
                        }
                    }
                    None => self.shared.frames_ready.wait(&mut inner),
                }
            }
            if inner.state != StreamState::Running {
                break;
            }

            if inner.round.len() < expected {
                let gathered = inner.round.len();
                let abandoned = inner.abandon_round();
                let sink = inner.sink.clone();
                drop(inner);

                warn!(
                    "Client {}: only {} of {} frames within {:?}, abandoning cycle",
                    self.client_id, gathered, expected, self.timeout
                );
                counter!("argus_aggregation_timeouts_total").increment(1);
                for frame in abandoned {
                    self.release(&frame);
                }
                if let Some(sink) = sink {
                    sink.notify(StreamEvent::Timeout { device_id: None });
                }
                continue;
            }

            let mut frames = std::mem::take(&mut inner.round);
            let sink = inner.sink.clone();
            drop(inner);

            for frame in &frames {
                self.last_delivered
                    .insert(frame.device_id.clone(), frame.timestamp);
            }
            frames.sort_by_key(|f| self.order_of(&f.device_id));
            if let Some(sink) = sink {
                sink.deliver_frames(frames);
            }
        }
        debug!("Client {}: capture worker exiting", self.client_id);
    }

    fn order_of(&self, device_id: &DeviceId) -> usize {
        self.devices
            .iter()
            .position(|(id, _)| id == device_id)
            .unwrap_or(usize::MAX)
    }

    fn release(&self, frame: &FrameBuffer) {
        let device = self
            .devices
            .iter()
            .find(|(id, _)| *id == frame.device_id)
            .and_then(|(_, weak)| weak.upgrade());
        if let Some(device) = device {
            device.done_with_frame(self.client_id, frame.frame_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{
        CameraProvider, HardwareEvent, ScriptedCamera, ScriptedProvider, StreamConfig,
    };
    use crate::session::sink::{ChannelSink, SinkMessage};
    use crate::Config;
    use arc_swap::ArcSwap;

    struct Rig {
        provider: ScriptedProvider,
        config: crate::SharedConfig,
    }

    impl Rig {
        fn new(ids: &[&str]) -> Self {
            let mut config = Config::default();
            config.device.skip_threshold_us = 0;
            Self {
                provider: ScriptedProvider::with_cameras(ids),
                config: Arc::new(ArcSwap::from_pointee(config)),
            }
        }

        fn device(&self, id: &str) -> (Arc<DeviceSession>, Arc<ScriptedCamera>) {
            let stream = StreamConfig::default();
            let handle = self.provider.open(id, &stream).unwrap();
            let device = DeviceSession::open(handle, stream, self.config.clone()).unwrap();
            (device, self.provider.camera(id).unwrap())
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(ms(2));
        }
    }

    fn next_frames(rx: &flume::Receiver<SinkMessage>) -> Vec<FrameBuffer> {
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                SinkMessage::Frames(frames) => return frames,
                SinkMessage::Event(_) => continue,
            }
        }
    }

    fn logical_client(
        devices: &[Arc<DeviceSession>],
        timeout: Duration,
    ) -> Arc<ClientSession> {
        let client = ClientSession::new(
            devices,
            ClientOptions {
                frames_in_flight: 1,
                frame_timeout: timeout,
            },
            None,
        );
        for device in devices {
            assert!(device.subscribe(&client));
        }
        client
    }

    #[test]
    fn held_quota_applies_backpressure() {
        let rig = Rig::new(&["cam0"]);
        let (device, camera) = rig.device("cam0");
        let client = device.spawn_client().unwrap();
        let (sink, rx) = ChannelSink::new();
        client.start_stream(Arc::new(sink)).unwrap();

        assert!(camera.emit_frame(1, ms(0)));
        assert!(camera.emit_frame(2, ms(33)));
        assert_eq!(camera.returned_buffers(), vec![2]);
        assert!(rx.try_iter().any(|m| matches!(
            m,
            SinkMessage::Event(StreamEvent::FrameDropped { .. })
        )));

        client.done_with_frame(1).unwrap();
        assert_eq!(camera.returned_buffers(), vec![2, 1]);
        assert!(camera.emit_frame(3, ms(66)));
        assert_eq!(client.held_count(), 1);
        assert!(client.done_with_frame(1).is_err());
    }

    #[test]
    fn second_start_is_refused() {
        let rig = Rig::new(&["cam0"]);
        let (device, _camera) = rig.device("cam0");
        let client = device.spawn_client().unwrap();
        let (sink, _rx) = ChannelSink::new();
        let sink = Arc::new(sink);
        client.start_stream(sink.clone()).unwrap();
        assert!(matches!(
            client.start_stream(sink.clone()),
            Err(BrokerError::StreamAlreadyRunning)
        ));
        client.stop_stream();
        client.start_stream(sink).unwrap();
    }

    #[test]
    fn failed_start_leaves_client_stopped() {
        let rig = Rig::new(&["cam0"]);
        let (device, camera) = rig.device("cam0");
        let client = device.spawn_client().unwrap();
        camera.fail_start(true);
        let (sink, _rx) = ChannelSink::new();
        assert!(client.start_stream(Arc::new(sink)).is_err());
        assert_eq!(client.stream_state(), StreamState::Stopped);
        assert_eq!(device.stream_state(), StreamState::Stopped);
    }

    #[test]
    fn logical_client_delivers_one_frame_per_device() {
        let rig = Rig::new(&["front", "rear"]);
        let (front, front_cam) = rig.device("front");
        let (rear, rear_cam) = rig.device("rear");
        let client = logical_client(&[front.clone(), rear.clone()], Duration::from_secs(2));
        let (sink, rx) = ChannelSink::new();
        client.start_stream(Arc::new(sink)).unwrap();

        wait_for(|| front.pending_requests() == 1 && rear.pending_requests() == 1);
        // Rear reports first; delivery still comes in device order
        assert!(rear_cam.emit_frame(7, ms(5)));
        assert!(front_cam.emit_frame(1, ms(0)));

        let frames = next_frames(&rx);
        let got: Vec<_> = frames
            .iter()
            .map(|f| (f.device_id.to_string(), f.frame_id))
            .collect();
        assert_eq!(got, vec![("front".into(), 1), ("rear".into(), 7)]);

        client.done_with_frames(&frames).unwrap();
        assert_eq!(front_cam.returned_buffers(), vec![1]);
        assert_eq!(rear_cam.returned_buffers(), vec![7]);

        client.stop_stream();
        assert!(!front_cam.is_streaming());
        assert!(!rear_cam.is_streaming());
    }

    #[test]
    fn logical_cycle_times_out_without_ending_stream() {
        let rig = Rig::new(&["front", "rear"]);
        let (front, front_cam) = rig.device("front");
        let (rear, rear_cam) = rig.device("rear");
        let client = logical_client(&[front.clone(), rear.clone()], ms(300));
        let (sink, rx) = ChannelSink::new();
        client.start_stream(Arc::new(sink)).unwrap();

        wait_for(|| front.pending_requests() == 1);
        assert!(front_cam.emit_frame(1, ms(0)));

        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                SinkMessage::Event(StreamEvent::Timeout { device_id: None }) => break,
                SinkMessage::Frames(_) => panic!("partial cycle was delivered"),
                SinkMessage::Event(_) => {}
            }
        }
        assert_eq!(front_cam.returned_buffers(), vec![1]);
        assert!(client.is_streaming());

        wait_for(|| front.pending_requests() == 1);
        assert!(front_cam.emit_frame(2, ms(33)));
        assert!(rear_cam.emit_frame(3, ms(34)));
        let frames = next_frames(&rx);
        assert_eq!(frames.len(), 2);
        client.done_with_frames(&frames).unwrap();
    }

    #[test]
    fn unexpected_stop_returns_partial_cycle() {
        let rig = Rig::new(&["front", "rear"]);
        let (front, front_cam) = rig.device("front");
        let (rear, rear_cam) = rig.device("rear");
        let client = logical_client(&[front.clone(), rear.clone()], Duration::from_secs(2));
        let (sink, _rx) = ChannelSink::new();
        client.start_stream(Arc::new(sink)).unwrap();

        wait_for(|| front.pending_requests() == 1 && rear.pending_requests() == 1);
        assert!(front_cam.emit_frame(1, ms(0)));
        assert!(front_cam.emit_event(HardwareEvent::StreamStopped));
        assert_eq!(client.stream_state(), StreamState::Stopped);
        assert_eq!(front_cam.returned_buffers(), vec![1]);
        assert_eq!(front.outstanding_frames(), 0);
        assert_eq!(client.held_count(), 0);

        // The restarted stream is not stuck behind the lost cycle
        let (sink, rx) = ChannelSink::new();
        client.start_stream(Arc::new(sink)).unwrap();
        wait_for(|| front.pending_requests() == 1 && rear.pending_requests() == 1);
        assert!(front_cam.emit_frame(2, ms(33)));
        assert!(rear_cam.emit_frame(3, ms(34)));
        let frames = next_frames(&rx);
        assert_eq!(frames.len(), 2);
        client.done_with_frames(&frames).unwrap();
        assert_eq!(front_cam.returned_buffers(), vec![1, 2]);
        assert_eq!(rear_cam.returned_buffers(), vec![3]);
    }

    #[test]
    fn logical_clients_cannot_arbitrate() {
        let rig = Rig::new(&["front", "rear"]);
        let (front, _) = rig.device("front");
        let (rear, _) = rig.device("rear");
        let client = logical_client(&[front.clone(), rear.clone()], ms(100));

        assert!(matches!(client.set_master(), Err(BrokerError::InvalidArg(_))));
        assert!(matches!(client.force_master(), Err(BrokerError::InvalidArg(_))));
        assert!(matches!(
            client.set_parameter(CameraParam::Brightness, 3),
            Err(BrokerError::InvalidArg(_))
        ));
        assert_eq!(client.get_parameter(CameraParam::Brightness).unwrap(), 0);
        assert!(!client.is_master());
    }

    #[test]
    fn non_master_write_reports_current_value() {
        let rig = Rig::new(&["cam0"]);
        let (device, _camera) = rig.device("cam0");
        let a = device.spawn_client().unwrap();
        let b = device.spawn_client().unwrap();
        let (sink, rx) = ChannelSink::new();
        b.start_stream(Arc::new(sink)).unwrap();

        a.set_master().unwrap();
        assert_eq!(a.set_parameter(CameraParam::Contrast, 400).unwrap(), 255);
        assert!(rx.try_iter().any(|m| matches!(
            m,
            SinkMessage::Event(StreamEvent::ParameterChanged { value: 255, .. })
        )));

        match b.set_parameter(CameraParam::Contrast, 10) {
            Err(BrokerError::Rejected { current, .. }) => assert_eq!(current, Some(255)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn gone_device_turns_writes_into_no_ops() {
        let rig = Rig::new(&["cam0"]);
        let (device, _camera) = rig.device("cam0");
        let client = device.spawn_client().unwrap();
        drop(device);

        assert_eq!(client.set_parameter(CameraParam::Sharpness, 9).unwrap(), 9);
        client.set_master().unwrap();
        assert!(matches!(
            client.get_parameter(CameraParam::Sharpness),
            Err(BrokerError::NotFound(_))
        ));
        assert!(client.parameter_list().is_empty());
        let (sink, _rx) = ChannelSink::new();
        client.start_stream(Arc::new(sink)).unwrap();
        client.stop_stream();
    }

    #[test]
    fn frames_in_flight_rolls_back_on_refusal() {
        let rig = Rig::new(&["front", "rear"]);
        let (front, front_cam) = rig.device("front");
        let (rear, rear_cam) = rig.device("rear");
        let client = logical_client(&[front.clone(), rear.clone()], ms(100));
        rear_cam.limit_quota(2);

        assert!(matches!(
            client.set_max_frames_in_flight(3),
            Err(BrokerError::Rejected { .. })
        ));
        assert_eq!(client.frames_allowed(), 1);
        assert_eq!(front.buffer_quota(), 1);
        assert_eq!(front_cam.quota(), 1);

        client.set_max_frames_in_flight(2).unwrap();
        assert_eq!(rear.buffer_quota(), 2);
        assert!(client.set_max_frames_in_flight(0).is_err());
    }

    #[test]
    fn dropping_client_returns_held_buffers() {
        let rig = Rig::new(&["cam0"]);
        let (device, camera) = rig.device("cam0");
        let client = device.spawn_client().unwrap();
        let (sink, _rx) = ChannelSink::new();
        client.start_stream(Arc::new(sink)).unwrap();
        camera.emit_frame(4, ms(0));
        assert_eq!(device.outstanding_frames(), 1);

        drop(client);
        assert_eq!(camera.returned_buffers(), vec![4]);
        assert_eq!(device.client_count(), 0);
        assert!(!camera.is_streaming());
    }
}
