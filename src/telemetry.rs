//! Final usage records emitted when a device session is torn down.

use std::time::Duration;

use color_eyre::Result;
use tracing::info;

use crate::hardware::DeviceId;
use crate::stats::UsageSnapshot;

#[derive(Debug, Clone)]
pub struct TelemetryRecord {
    pub device_id: DeviceId,
    pub lifetime: Duration,
    pub snapshot: UsageSnapshot,
}

/// Destination for teardown records. Emission is fire-and-forget; the broker
/// only logs a failure.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, record: &TelemetryRecord) -> Result<()>;
}

/// Writes records to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    fn emit(&self, record: &TelemetryRecord) -> Result<()> {
        let s = &record.snapshot;
        info!(
            device = %record.device_id,
            lifetime_ms = record.lifetime.as_millis() as u64,
            frames_received = s.frames_received,
            frames_ignored = s.frames_ignored,
            frames_skipped = s.frames_skipped_to_sync,
            frames_returned = s.frames_returned,
            erroneous_events = s.erroneous_events,
            peak_clients = s.peak_clients,
            "Device session closed"
        );
        Ok(())
    }
}
