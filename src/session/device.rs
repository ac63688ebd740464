//! One physical camera shared by many client sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::client::{ClientId, ClientOptions, ClientSession};
use super::ledger::{BufferLedger, Release};
use super::requests::{FrameRequest, RequestQueues};
use super::sink::StreamEvent;
use super::StreamState;
use crate::broker::Registry;
use crate::error::{BrokerError, Result};
use crate::hardware::{
    CameraDevice, CameraParam, DeviceId, FrameBuffer, FrameId, HardwareEvent, HardwareStream,
    ParameterRange, StreamConfig,
};
use crate::stats::{UsageSnapshot, UsageSource, UsageStats};
use crate::SharedConfig;

struct Subscriber {
    id: ClientId,
    client: Weak<ClientSession>,
    quota: u32,
}

struct MasterSlot {
    id: ClientId,
    client: Weak<ClientSession>,
}

struct DeviceState {
    stream: StreamState,
    subscribers: Vec<Subscriber>,
    master: Option<MasterSlot>,
    ledger: BufferLedger,
    buffer_quota: u32,
}

impl DeviceState {
    fn prune(&mut self) {
        self.subscribers.retain(|s| s.client.strong_count() > 0);
    }

    /// Aggregate quota with `id` requesting `quota` (or absent when `None`)
    fn wanted_quota(&self, id: ClientId, quota: Option<u32>) -> u32 {
        let others: u32 = self
            .subscribers
            .iter()
            .filter(|s| s.id != id && s.client.strong_count() > 0)
            .map(|s| s.quota)
            .sum();
        (others + quota.unwrap_or(0)).max(1)
    }
}

/// Forwards hardware callbacks without keeping the session alive
struct StreamRelay(Weak<DeviceSession>);

impl HardwareStream for StreamRelay {
    fn on_frame(&self, frame: FrameBuffer) {
        match self.0.upgrade() {
            Some(device) => device.on_frame_delivered(frame),
            None => debug!("Frame {} arrived after session teardown", frame.frame_id),
        }
    }

    fn on_event(&self, event: HardwareEvent) {
        if let Some(device) = self.0.upgrade() {
            device.on_hardware_event(event);
        }
    }
}

/// Owns one camera handle and fans its frames out to subscribed clients
pub struct DeviceSession {
    id: DeviceId,
    stream_config: StreamConfig,
    hardware: Box<dyn CameraDevice>,
    config: SharedConfig,
    state: Mutex<DeviceState>,
    requests: Mutex<RequestQueues>,
    stats: UsageStats,
    closed: AtomicBool,
    weak_self: Weak<DeviceSession>,
}

impl DeviceSession {
    /// Take ownership of an open camera handle
    pub fn open(
        hardware: Box<dyn CameraDevice>,
        stream_config: StreamConfig,
        config: SharedConfig,
    ) -> Result<Arc<Self>> {
        let initial_quota = config.load().device.default_buffer_quota.max(1);
        hardware.set_buffer_quota(initial_quota)?;
        let id: DeviceId = hardware.id().into();
        info!("{}: device session opened", id);

        Ok(Arc::new_cyclic(|weak_self| Self {
            id,
            stream_config,
            hardware,
            config,
            state: Mutex::new(DeviceState {
                stream: StreamState::Stopped,
                subscribers: Vec::new(),
                master: None,
                ledger: BufferLedger::new(),
                buffer_quota: initial_quota,
            }),
            requests: Mutex::new(RequestQueues::default()),
            stats: UsageStats::default(),
            closed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        }))
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.stream_config
    }

    /// Create a single-device client already subscribed to this session
    pub fn spawn_client(self: &Arc<Self>) -> Result<Arc<ClientSession>> {
        self.spawn_client_in(None)
    }

    pub(crate) fn spawn_client_in(
        self: &Arc<Self>,
        registry: Option<Weak<Registry>>,
    ) -> Result<Arc<ClientSession>> {
        let options = ClientOptions::from(&self.config.load().client);
        let client = ClientSession::new(std::slice::from_ref(self), options, registry);
        if self.subscribe(&client) {
            Ok(client)
        } else {
            client.detach();
            Err(BrokerError::rejected("buffer quota unavailable"))
        }
    }

    /// Add a client, growing the hardware buffer pool to cover its quota.
    /// On `false` the client was not added and must not be retained.
    pub fn subscribe(&self, client: &Arc<ClientSession>) -> bool {
        let mut state = self.state.lock();
        state.prune();
        if state.subscribers.iter().any(|s| s.id == client.id()) {
            return true;
        }

        let quota = client.frames_allowed();
        let wanted = state.wanted_quota(client.id(), Some(quota));
        if wanted != state.buffer_quota {
            if let Err(e) = self.hardware.set_buffer_quota(wanted) {
                warn!(
                    "{}: cannot grow buffer pool to {} for client {}: {}",
                    self.id,
                    wanted,
                    client.id(),
                    e
                );
                return false;
            }
            state.buffer_quota = wanted;
        }

        state.subscribers.push(Subscriber {
            id: client.id(),
            client: Arc::downgrade(client),
            quota,
        });
        self.stats.observe_clients(state.subscribers.len());
        debug!(
            "{}: client {} subscribed, buffer quota {}",
            self.id,
            client.id(),
            wanted
        );
        true
    }

    /// Remove a client, shrinking the buffer pool and freeing the master role
    /// if it held it
    pub fn unsubscribe(&self, client_id: ClientId) {
        let released_master = {
            // A dying client may already have been pruned; the quota and
            // master slot are settled either way
            let mut state = self.state.lock();
            state.subscribers.retain(|s| s.id != client_id);
            state.prune();

            let wanted = state.wanted_quota(client_id, None);
            if wanted != state.buffer_quota {
                match self.hardware.set_buffer_quota(wanted) {
                    Ok(()) => state.buffer_quota = wanted,
                    Err(e) => warn!("{}: failed to shrink buffer pool: {}", self.id, e),
                }
            }

            let was_master = state.master.as_ref().is_some_and(|m| m.id == client_id);
            if was_master {
                state.master = None;
            }
            was_master
        };

        self.requests.lock().purge(client_id);
        debug!("{}: client {} unsubscribed", self.id, client_id);

        if released_master {
            info!("{}: master client {} left", self.id, client_id);
            self.broadcast(StreamEvent::MasterReleased {
                device_id: self.id.clone(),
            });
        }
    }

    /// Live subscribers; resolved under the lock, used outside it
    fn live_clients(&self) -> Vec<Arc<ClientSession>> {
        let state = self.state.lock();
        state
            .subscribers
            .iter()
            .filter_map(|s| s.client.upgrade())
            .collect()
    }

    fn broadcast(&self, event: StreamEvent) {
        for client in self.live_clients() {
            client.notify_event(event.clone());
        }
    }

    pub fn client_count(&self) -> usize {
        self.state
            .lock()
            .subscribers
            .iter()
            .filter(|s| s.client.strong_count() > 0)
            .count()
    }

    pub fn subscriber_ids(&self) -> Vec<ClientId> {
        self.state.lock().subscribers.iter().map(|s| s.id).collect()
    }

    pub fn buffer_quota(&self) -> u32 {
        self.state.lock().buffer_quota
    }

    pub fn stream_state(&self) -> StreamState {
        self.state.lock().stream
    }

    pub fn outstanding_frames(&self) -> usize {
        self.state.lock().ledger.outstanding()
    }

    pub fn ref_count(&self, frame_id: FrameId) -> u32 {
        self.state.lock().ledger.ref_count(frame_id)
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.lock().pending()
    }

    /// Ask for the next frame on behalf of a client
    pub fn request_frame(
        &self,
        client_id: ClientId,
        client: Weak<ClientSession>,
        last_timestamp: Option<std::time::Duration>,
    ) {
        self.requests.lock().push(FrameRequest {
            client_id,
            client,
            last_timestamp,
        });
    }

    /// Fan a fresh buffer out to every client with a pending request.
    ///
    /// The session holds its own reference on the buffer for the duration of
    /// the fan-out, so a client returning the frame from inside its sink can
    /// never drive the count to zero early.
    pub fn on_frame_delivered(&self, frame: FrameBuffer) {
        let batch = self.requests.lock().swap_and_take();
        self.state.lock().ledger.acquire(frame.frame_id);

        let threshold = self.config.load().device.skip_threshold();
        let mut deferred = Vec::new();
        let mut deliveries = 0usize;
        for request in batch {
            let Some(client) = request.client.upgrade() else {
                debug!("{}: dropping request from dead client {}", self.id, request.client_id);
                continue;
            };
            if let Some(last) = request.last_timestamp {
                if frame.timestamp.saturating_sub(last) < threshold {
                    debug!(
                        "{}: frame {} too soon for client {}, deferring",
                        self.id, frame.frame_id, request.client_id
                    );
                    self.stats.frame_skipped_to_sync();
                    counter!("argus_frames_skipped_total", "device" => self.id.to_string())
                        .increment(1);
                    deferred.push(request);
                    continue;
                }
            }

            self.state.lock().ledger.add_ref(frame.frame_id);
            if client.deliver_frame(&frame) {
                deliveries += 1;
            } else {
                self.state.lock().ledger.release(frame.frame_id);
            }
        }
        if !deferred.is_empty() {
            self.requests.lock().defer(deferred);
        }

        if deliveries == 0 {
            self.stats.frame_ignored();
            counter!("argus_frames_ignored_total", "device" => self.id.to_string()).increment(1);
        } else {
            self.stats.frame_received();
            counter!("argus_frames_received_total", "device" => self.id.to_string())
                .increment(1);
            self.stats
                .observe_frames_in_flight(self.state.lock().ledger.outstanding());
        }

        let release = self.state.lock().ledger.release(frame.frame_id);
        self.settle(frame.frame_id, release, deliveries > 0);
    }

    /// A client is finished with a buffer
    pub fn done_with_frame(&self, client_id: ClientId, frame_id: FrameId) {
        let release = self.state.lock().ledger.release(frame_id);
        if release == Release::Unknown {
            warn!(
                "{}: client {} returned unknown buffer {}",
                self.id, client_id, frame_id
            );
        }
        self.settle(frame_id, release, true);
    }

    fn settle(&self, frame_id: FrameId, release: Release, delivered: bool) {
        if let Release::Returned { held_for } = release {
            self.hardware.return_buffer(frame_id);
            if delivered {
                self.stats.frame_returned(held_for);
                counter!("argus_frames_returned_total", "device" => self.id.to_string())
                    .increment(1);
            }
        }
    }

    /// Start the hardware stream if this is the first streaming client
    pub fn client_stream_starting(&self) -> Result<()> {
        let start = {
            let mut state = self.state.lock();
            match state.stream {
                StreamState::Running => false,
                StreamState::Stopped | StreamState::Stopping => {
                    state.stream = StreamState::Running;
                    true
                }
            }
        };
        if !start {
            return Ok(());
        }

        let relay = Arc::new(StreamRelay(self.weak_self.clone()));
        if let Err(e) = self.hardware.start_stream(relay) {
            error!("{}: failed to start stream: {}", self.id, e);
            self.state.lock().stream = StreamState::Stopped;
            return Err(e.into());
        }
        info!("{}: stream started", self.id);
        Ok(())
    }

    /// A client stopped streaming; stop the hardware once nobody streams
    pub fn client_stream_ending(&self, client_id: ClientId) {
        self.requests.lock().purge(client_id);

        let still_needed = self
            .live_clients()
            .into_iter()
            .any(|c| c.id() != client_id && c.is_streaming());
        if still_needed {
            return;
        }
        self.stop_hardware_stream();
    }

    fn stop_hardware_stream(&self) {
        let stop = {
            let mut state = self.state.lock();
            if state.stream == StreamState::Running {
                state.stream = StreamState::Stopping;
                true
            } else {
                false
            }
        };
        if !stop {
            return;
        }
        info!("{}: stopping stream", self.id);
        if let Err(e) = self.hardware.stop_stream() {
            error!("{}: failed to stop stream: {}", self.id, e);
            self.state.lock().stream = StreamState::Stopped;
        }
    }

    pub fn on_hardware_event(&self, event: HardwareEvent) {
        let device_id = self.id.clone();
        let forwarded = match event {
            HardwareEvent::StreamStarted => StreamEvent::StreamStarted,
            HardwareEvent::StreamStopped => {
                let expected = {
                    let mut state = self.state.lock();
                    let expected = state.stream == StreamState::Stopping;
                    state.stream = StreamState::Stopped;
                    expected
                };
                if !expected {
                    warn!("{}: stream stopped unexpectedly", self.id);
                    self.stats.erroneous_event();
                }
                StreamEvent::StreamStopped
            }
            HardwareEvent::FrameDropped => StreamEvent::FrameDropped { device_id },
            HardwareEvent::Timeout => StreamEvent::Timeout {
                device_id: Some(device_id),
            },
            HardwareEvent::ParameterChanged { param, value } => StreamEvent::ParameterChanged {
                device_id,
                param,
                value,
            },
        };
        self.broadcast(forwarded);
    }

    /// Change the quota one subscriber asks for
    pub fn change_client_quota(&self, client_id: ClientId, quota: u32) -> Result<()> {
        let mut state = self.state.lock();
        if !state.subscribers.iter().any(|s| s.id == client_id) {
            return Err(BrokerError::InvalidArg(format!(
                "client {client_id} is not subscribed to {}",
                self.id
            )));
        }
        let wanted = state.wanted_quota(client_id, Some(quota));
        if wanted != state.buffer_quota {
            if let Err(e) = self.hardware.set_buffer_quota(wanted) {
                warn!("{}: buffer quota {} refused: {}", self.id, wanted, e);
                return Err(BrokerError::rejected("buffer quota unavailable"));
            }
            state.buffer_quota = wanted;
        }
        if let Some(subscriber) = state.subscribers.iter_mut().find(|s| s.id == client_id) {
            subscriber.quota = quota;
        }
        Ok(())
    }

    pub fn master_id(&self) -> Option<ClientId> {
        let state = self.state.lock();
        state
            .master
            .as_ref()
            .filter(|m| m.client.strong_count() > 0)
            .map(|m| m.id)
    }

    pub fn is_master(&self, client_id: ClientId) -> bool {
        self.master_id() == Some(client_id)
    }

    fn ensure_subscribed(state: &DeviceState, id: &DeviceId, client_id: ClientId) -> Result<()> {
        if state.subscribers.iter().any(|s| s.id == client_id) {
            Ok(())
        } else {
            Err(BrokerError::InvalidArg(format!(
                "client {client_id} is not subscribed to {id}"
            )))
        }
    }

    /// Claim the master role if nobody holds it
    pub fn set_master(&self, client_id: ClientId, client: &Weak<ClientSession>) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_subscribed(&state, &self.id, client_id)?;
        match &state.master {
            Some(m) if m.id == client_id => Ok(()),
            Some(m) if m.client.strong_count() > 0 => {
                Err(BrokerError::AlreadyMastered(self.id.to_string()))
            }
            _ => {
                state.master = Some(MasterSlot {
                    id: client_id,
                    client: client.clone(),
                });
                info!("{}: client {} is now master", self.id, client_id);
                Ok(())
            }
        }
    }

    /// Take the master role unconditionally, telling the previous master
    #[instrument(skip(self, client), fields(device = %self.id))]
    pub fn force_master(&self, client_id: ClientId, client: &Weak<ClientSession>) -> Result<()> {
        let previous = {
            let mut state = self.state.lock();
            Self::ensure_subscribed(&state, &self.id, client_id)?;
            let previous = state.master.replace(MasterSlot {
                id: client_id,
                client: client.clone(),
            });
            previous.filter(|p| p.id != client_id)
        };
        info!("{}: client {} forced master role", self.id, client_id);

        if let Some(previous) = previous.and_then(|p| p.client.upgrade()) {
            previous.notify_event(StreamEvent::MasterReleased {
                device_id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Give up the master role; only the master may do this
    pub fn unset_master(&self, client_id: ClientId) -> Result<()> {
        {
            let mut state = self.state.lock();
            match &state.master {
                Some(m) if m.id == client_id => state.master = None,
                _ => {
                    return Err(BrokerError::InvalidArg(format!(
                        "client {client_id} is not the master of {}",
                        self.id
                    )))
                }
            }
        }
        info!("{}: client {} released master role", self.id, client_id);
        self.broadcast(StreamEvent::MasterReleased {
            device_id: self.id.clone(),
        });
        Ok(())
    }

    /// Write a camera parameter. Only the master may write; anybody else gets
    /// `Rejected` carrying the value currently in effect.
    pub fn set_parameter(&self, client_id: ClientId, param: CameraParam, value: i32) -> Result<i32> {
        if !self.is_master(client_id) {
            let current = self.hardware.get_parameter(param).ok();
            debug!(
                "{}: client {} is not master, {:?} write rejected",
                self.id, client_id, param
            );
            return Err(BrokerError::Rejected {
                reason: "only the master client may change parameters",
                current,
            });
        }

        let applied = self.hardware.set_parameter(param, value)?;
        self.broadcast(StreamEvent::ParameterChanged {
            device_id: self.id.clone(),
            param,
            value: applied,
        });
        Ok(applied)
    }

    pub fn get_parameter(&self, param: CameraParam) -> Result<i32> {
        Ok(self.hardware.get_parameter(param)?)
    }

    pub fn parameter_range(&self, param: CameraParam) -> Result<ParameterRange> {
        Ok(self.hardware.parameter_range(param)?)
    }

    pub fn parameter_list(&self) -> Vec<CameraParam> {
        self.hardware.parameter_list()
    }

    pub fn get_extended_info(&self, key: u32) -> Result<Vec<u8>> {
        Ok(self.hardware.get_extended_info(key)?)
    }

    pub fn set_extended_info(&self, client_id: ClientId, key: u32, value: &[u8]) -> Result<()> {
        if !self.is_master(client_id) {
            return Err(BrokerError::rejected(
                "only the master client may change extended info",
            ));
        }
        Ok(self.hardware.set_extended_info(key, value)?)
    }

    /// Stop the stream, hand every outstanding buffer back and release the
    /// hardware. Idempotent; returns the final usage snapshot.
    #[instrument(skip(self), fields(device = %self.id))]
    pub fn shutdown(&self) -> UsageSnapshot {
        if self.closed.swap(true, Ordering::AcqRel) {
            return self.usage_snapshot();
        }

        self.stop_hardware_stream();
        let owed = self.state.lock().ledger.drain();
        if !owed.is_empty() {
            debug!("{}: returning {} outstanding buffers", self.id, owed.len());
        }
        for frame_id in owed {
            self.hardware.return_buffer(frame_id);
        }
        *self.requests.lock() = RequestQueues::default();
        {
            let mut state = self.state.lock();
            state.master = None;
            state.stream = StreamState::Stopped;
        }
        self.hardware.close();
        info!("{}: device session closed", self.id);
        self.usage_snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn lifetime(&self) -> std::time::Duration {
        self.stats.lifetime()
    }
}

impl UsageSource for DeviceSession {
    fn source_id(&self) -> DeviceId {
        self.id.clone()
    }

    fn usage_snapshot(&self) -> UsageSnapshot {
        let (quota, clients) = {
            let state = self.state.lock();
            let clients = state
                .subscribers
                .iter()
                .filter(|s| s.client.strong_count() > 0)
                .count();
            (state.buffer_quota, clients)
        };
        self.stats.snapshot(quota, clients)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
