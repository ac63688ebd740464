//! Device registry and the client-facing entry points.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::gauge;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::access::{AccessPolicy, AllowAll};
use crate::dump::{self, DumpTarget};
use crate::error::{BrokerError, Result};
use crate::hardware::{CameraDescriptor, CameraProvider, DeviceId, StreamConfig};
use crate::session::{ClientOptions, ClientSession, DeviceSession};
use crate::stats::{UsageScheduler, UsageSource};
use crate::telemetry::{LogTelemetry, TelemetryRecord, TelemetrySink};
use crate::{Config, SharedConfig};

/// State shared between the broker and the clients it hands out.
///
/// The device map holds the only strong references to device sessions. It is
/// locked before any device state; devices are shut down outside of it.
pub struct Registry {
    provider: Box<dyn CameraProvider>,
    access: Box<dyn AccessPolicy>,
    telemetry: Box<dyn TelemetrySink>,
    config: SharedConfig,
    scheduler: UsageScheduler,
    devices: Mutex<HashMap<DeviceId, Arc<DeviceSession>>>,
}

type DeviceMap = HashMap<DeviceId, Arc<DeviceSession>>;

impl Registry {
    fn authorize(&self) -> Result<()> {
        if self.access.is_caller_authorized() {
            Ok(())
        } else {
            warn!("Unauthorized caller refused");
            Err(BrokerError::PermissionDenied)
        }
    }

    fn describe(&self, id: &str) -> Result<CameraDescriptor> {
        self.provider
            .describe(id)
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))
    }

    /// Find the live session for `id` or open one configured with
    /// `create_with`. A `required` configuration must match a live session.
    fn attach(
        &self,
        devices: &mut DeviceMap,
        id: &DeviceId,
        required: Option<&StreamConfig>,
        create_with: StreamConfig,
    ) -> Result<(Arc<DeviceSession>, bool)> {
        if let Some(existing) = devices.get(id) {
            if let Some(required) = required {
                if required != existing.stream_config() {
                    return Err(BrokerError::Busy(format!(
                        "{id} is streaming {:?}",
                        existing.stream_config()
                    )));
                }
            }
            return Ok((existing.clone(), false));
        }

        let hardware = self.provider.open(id, &create_with)?;
        let session = DeviceSession::open(hardware, create_with, self.config.clone())?;
        if let Err(e) = self.scheduler.register_client(&session) {
            warn!("{}: usage will not be collected: {}", id, e);
        }
        devices.insert(id.clone(), session.clone());
        gauge!("argus_live_devices").set(devices.len() as f64);
        info!("{}: opened at {}x{}@{}", id, create_with.width, create_with.height, create_with.fps);
        Ok((session, true))
    }

    fn open_physical(
        self: &Arc<Self>,
        descriptor: &CameraDescriptor,
        required: Option<StreamConfig>,
    ) -> Result<Arc<ClientSession>> {
        let id = &descriptor.id;
        let create_with = required.unwrap_or(descriptor.default_stream);
        let (outcome, orphan) = {
            let mut devices = self.devices.lock();
            let (device, created) = self.attach(&mut devices, id, required.as_ref(), create_with)?;
            match device.spawn_client_in(Some(Arc::downgrade(self))) {
                Ok(client) => (Ok(client), None),
                Err(e) if created => {
                    devices.remove(id);
                    (Err(e), Some(device))
                }
                Err(e) => (Err(e), None),
            }
        };
        if let Some(orphan) = orphan {
            self.retire(orphan);
        }
        outcome
    }

    fn open_logical(
        self: &Arc<Self>,
        descriptor: &CameraDescriptor,
        stream: StreamConfig,
    ) -> Result<Arc<ClientSession>> {
        if descriptor.physical_ids.is_empty() {
            return Err(BrokerError::InvalidArg(format!(
                "logical camera {} has no physical cameras",
                descriptor.id
            )));
        }

        let (outcome, orphans) = {
            let mut devices = self.devices.lock();
            let mut created = Vec::new();
            let mut sessions = Vec::new();
            let mut failure = None;
            for id in &descriptor.physical_ids {
                match self.attach(&mut devices, id, None, stream) {
                    Ok((session, fresh)) => {
                        if fresh {
                            created.push(id.clone());
                        }
                        sessions.push(session);
                    }
                    Err(e) => {
                        warn!("{}: cannot open {} for logical camera: {}", descriptor.id, id, e);
                        failure = Some(e);
                        break;
                    }
                }
            }

            let outcome = match failure {
                Some(e) => Err(e),
                None => {
                    let options = ClientOptions::from(&self.config.load().client);
                    let client =
                        ClientSession::new(&sessions, options, Some(Arc::downgrade(self)));
                    if sessions.iter().all(|session| session.subscribe(&client)) {
                        Ok(client)
                    } else {
                        client.detach();
                        Err(BrokerError::rejected("buffer quota unavailable"))
                    }
                }
            };
            drop(sessions);

            let orphans: Vec<_> = if outcome.is_err() {
                created.iter().filter_map(|id| devices.remove(id)).collect()
            } else {
                Vec::new()
            };
            (outcome, orphans)
        };

        if !orphans.is_empty() {
            debug!(
                "{}: rolling back {} newly opened cameras",
                descriptor.id,
                orphans.len()
            );
        }
        for orphan in orphans {
            self.retire(orphan);
        }
        outcome
    }

    /// Retire every listed device nobody is subscribed to anymore
    pub(crate) fn reap(&self, ids: &[DeviceId]) {
        let idle: Vec<_> = {
            let mut devices = self.devices.lock();
            let idle_ids: Vec<_> = ids
                .iter()
                .filter(|id| devices.get(*id).is_some_and(|d| d.client_count() == 0))
                .cloned()
                .collect();
            let idle = idle_ids
                .iter()
                .filter_map(|id| devices.remove(id))
                .collect();
            gauge!("argus_live_devices").set(devices.len() as f64);
            idle
        };
        for device in idle {
            self.retire(device);
        }
    }

    fn retire(&self, device: Arc<DeviceSession>) {
        let id = device.id().clone();
        if let Err(e) = self.scheduler.unregister_client(&id) {
            debug!("{}: {}", id, e);
        }
        let snapshot = device.shutdown();
        let record = TelemetryRecord {
            device_id: id.clone(),
            lifetime: device.lifetime(),
            snapshot,
        };
        if let Err(e) = self.telemetry.emit(&record) {
            warn!("{}: telemetry not recorded: {}", id, e);
        }
        info!("{}: retired", id);
    }
}

pub struct BrokerBuilder {
    provider: Box<dyn CameraProvider>,
    access: Box<dyn AccessPolicy>,
    telemetry: Box<dyn TelemetrySink>,
    config: Config,
}

impl BrokerBuilder {
    pub fn access_policy(mut self, policy: impl AccessPolicy + 'static) -> Self {
        self.access = Box::new(policy);
        self
    }

    pub fn telemetry(mut self, sink: impl TelemetrySink + 'static) -> Self {
        self.telemetry = Box::new(sink);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Start the usage scheduler and hand out the broker
    pub fn build(self) -> Result<Broker> {
        let scheduler = UsageScheduler::start(&self.config.stats)?;
        Ok(Broker {
            registry: Arc::new(Registry {
                provider: self.provider,
                access: self.access,
                telemetry: self.telemetry,
                config: Arc::new(ArcSwap::from_pointee(self.config)),
                scheduler,
                devices: Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// Shares the provider's cameras between any number of clients
pub struct Broker {
    registry: Arc<Registry>,
}

impl Broker {
    pub fn builder(provider: impl CameraProvider + 'static) -> BrokerBuilder {
        BrokerBuilder {
            provider: Box::new(provider),
            access: Box::new(AllowAll),
            telemetry: Box::new(LogTelemetry),
            config: Config::default(),
        }
    }

    pub fn camera_list(&self) -> Result<Vec<CameraDescriptor>> {
        self.registry.authorize()?;
        Ok(self.registry.provider.cameras())
    }

    /// Open a client on a physical or logical camera in its default
    /// configuration, sharing a live device session if there is one
    #[instrument(skip(self))]
    pub fn open_client(&self, id: &str) -> Result<Arc<ClientSession>> {
        self.registry.authorize()?;
        let descriptor = self.registry.describe(id)?;
        if descriptor.is_logical() {
            return self
                .registry
                .open_logical(&descriptor, descriptor.default_stream);
        }
        self.registry.open_physical(&descriptor, None)
    }

    /// Open a client requiring a specific stream configuration. Fails with
    /// `Busy` when the device is already live in another configuration.
    #[instrument(skip(self))]
    pub fn open_client_with(&self, id: &str, stream: &StreamConfig) -> Result<Arc<ClientSession>> {
        self.registry.authorize()?;
        let descriptor = self.registry.describe(id)?;
        if descriptor.is_logical() {
            return self.registry.open_logical(&descriptor, *stream);
        }
        self.registry.open_physical(&descriptor, Some(*stream))
    }

    /// Open one client spanning every physical camera of a logical camera.
    /// Cameras opened by this call are closed again if any step fails.
    #[instrument(skip(self))]
    pub fn open_logical_client(
        &self,
        id: &str,
        stream: &StreamConfig,
    ) -> Result<Arc<ClientSession>> {
        self.registry.authorize()?;
        let descriptor = self.registry.describe(id)?;
        if !descriptor.is_logical() {
            return Err(BrokerError::InvalidArg(format!("{id} is not a logical camera")));
        }
        self.registry.open_logical(&descriptor, *stream)
    }

    /// Tear the client down and retire devices left without subscribers
    #[instrument(skip_all, fields(client = client.id()))]
    pub fn close_client(&self, client: &ClientSession) -> Result<()> {
        self.registry.authorize()?;
        client.close();
        self.registry.reap(&client.device_ids());
        Ok(())
    }

    /// Run `f` against a live device session without extending its lifetime
    pub fn with_device<R>(&self, id: &str, f: impl FnOnce(&DeviceSession) -> R) -> Option<R> {
        let device = self.registry.devices.lock().get(id).cloned()?;
        Some(f(&device))
    }

    pub fn active_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.registry.devices.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Swap in a new configuration. Device and client tuning applies to the
    /// next frame or session; stats intervals apply on restart.
    pub fn reload_config(&self, config: Config) {
        self.registry.config.store(Arc::new(config));
        info!("Configuration reloaded");
    }

    pub fn config(&self) -> Arc<Config> {
        self.registry.config.load_full()
    }

    pub fn scheduler(&self) -> &UsageScheduler {
        &self.registry.scheduler
    }

    pub fn dump(&self, target: DumpTarget) -> String {
        let mut devices: Vec<_> = self
            .registry
            .devices
            .lock()
            .values()
            .filter(|d| target.matches(d.id()))
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));

        let mut out = String::new();
        dump::write_line(&mut out, 0, format_args!("{} live devices", devices.len()));
        for device in &devices {
            let stream = device.stream_config();
            dump::write_line(
                &mut out,
                1,
                format_args!(
                    "{}: {} {}x{}@{} {:?}",
                    device.id(),
                    device.stream_state(),
                    stream.width,
                    stream.height,
                    stream.fps,
                    stream.format
                ),
            );
            let master = device
                .master_id()
                .map_or_else(|| "none".to_string(), |id| id.to_string());
            dump::write_line(
                &mut out,
                2,
                format_args!(
                    "clients={:?} master={} quota={} outstanding={} pending_requests={}",
                    device.subscriber_ids(),
                    master,
                    device.buffer_quota(),
                    device.outstanding_frames(),
                    device.pending_requests()
                ),
            );
            dump::write_snapshot(&mut out, 2, "usage", &device.usage_snapshot());
        }
        drop(devices);

        match self.registry.scheduler.dump(target) {
            Ok(text) => out.push_str(&text),
            Err(e) => dump::write_line(&mut out, 0, format_args!("Usage collection: {e}")),
        }
        out
    }

    /// Close every device session and stop the usage scheduler. Clients
    /// still alive afterwards see their devices as gone.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        let devices: Vec<_> = {
            let mut devices = self.registry.devices.lock();
            gauge!("argus_live_devices").set(0.0);
            devices.drain().map(|(_, device)| device).collect()
        };
        for device in devices {
            self.registry.retire(device);
        }
        self.registry.scheduler.shutdown();
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
