//! Camera virtualization broker.
//!
//! A [`Broker`] shares a finite set of physical cameras between any number of
//! client sessions. Each physical camera is driven by exactly one
//! [`DeviceSession`], which fans its frame stream out to the
//! [`ClientSession`]s subscribed to it, arbitrates the single master allowed to
//! change camera controls, and reference counts every buffer until all holders
//! are done with it. A logical client aggregates several physical cameras into
//! one synchronized stream. A [`UsageScheduler`] samples usage statistics from
//! every live device on its own thread.

pub mod access;
pub mod broker;
pub mod dump;
pub mod error;
pub mod hardware;
pub mod session;
pub mod stats;
pub mod telemetry;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use access::{AccessPolicy, AllowAll};
pub use broker::{Broker, BrokerBuilder};
pub use dump::DumpTarget;
pub use error::{BrokerError, Result};
pub use hardware::{
    CameraDescriptor, CameraDevice, CameraParam, CameraProvider, DeviceId, FrameBuffer, FrameId,
    HardwareError, HardwareEvent, PixelFormat, StreamConfig,
};
pub use session::{
    ChannelSink, ClientSession, DeviceSession, FrameSink, SinkMessage, StreamEvent, StreamState,
};
pub use stats::{UsageSample, UsageScheduler, UsageSnapshot};
pub use telemetry::{LogTelemetry, TelemetryRecord, TelemetrySink};

/// Live configuration, swapped atomically on reload
pub type SharedConfig = Arc<ArcSwap<Config>>;

/// Broker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub client: ClientConfig,
    pub stats: StatsConfig,
    pub hardware: HardwareConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Buffers requested from the hardware before any client subscribes
    pub default_buffer_quota: u32,
    /// A frame arriving sooner than this after the previous one delivered to
    /// the same client is held back for that client until the next frame
    pub skip_threshold_us: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a logical client waits for all its cameras in one cycle
    pub frame_timeout_ms: u64,
    pub default_frames_in_flight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub periodic_interval_ms: u64,
    pub periodic_history: usize,
    pub min_custom_interval_ms: u64,
    pub max_custom_duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub cameras: Vec<VirtualCameraConfig>,
    pub logical_cameras: Vec<LogicalCameraConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualCameraConfig {
    pub id: String,
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalCameraConfig {
    pub id: String,
    pub physical_ids: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            default_buffer_quota: 1,
            // About half of a 30 fps frame interval
            skip_threshold_us: 16_000,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 5_000,
            default_frames_in_flight: 1,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            periodic_interval_ms: 10_000,
            periodic_history: 180,
            min_custom_interval_ms: 1_000,
            max_custom_duration_ms: 30 * 60 * 1_000,
        }
    }
}

impl DeviceConfig {
    pub fn skip_threshold(&self) -> Duration {
        Duration::from_micros(self.skip_threshold_us)
    }
}

impl ClientConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

impl StatsConfig {
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_interval_ms)
    }

    pub fn min_custom_interval(&self) -> Duration {
        Duration::from_millis(self.min_custom_interval_ms)
    }

    pub fn max_custom_duration(&self) -> Duration {
        Duration::from_millis(self.max_custom_duration_ms)
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `ARGUS__SECTION__KEY`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("ARGUS")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
