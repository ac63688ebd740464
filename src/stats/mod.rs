//! Per-device usage counters and the scheduler that samples them.

mod history;
pub mod scheduler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use crossbeam::utils::CachePadded;
use serde::Serialize;

use crate::hardware::DeviceId;

pub use history::SampleRing;
pub use scheduler::{CollectionMode, CustomReport, UsageScheduler};

/// Anything the usage scheduler can sample
pub trait UsageSource: Send + Sync {
    fn source_id(&self) -> DeviceId;
    fn usage_snapshot(&self) -> UsageSnapshot;
}

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_ignored: AtomicU64,
    frames_skipped_to_sync: AtomicU64,
    frames_returned: AtomicU64,
    erroneous_events: AtomicU64,
    peak_clients: AtomicU64,
    peak_frames_in_flight: AtomicU64,
    hold_time_us: AtomicU64,
}

/// Live counters of one device session, updated from the delivery path
/// without taking any lock.
pub struct UsageStats {
    counters: CachePadded<Counters>,
    created_at: Instant,
}

impl Default for UsageStats {
    fn default() -> Self {
        Self {
            counters: CachePadded::new(Counters::default()),
            created_at: Instant::now(),
        }
    }
}

impl UsageStats {
    pub fn frame_received(&self) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_ignored(&self) {
        self.counters.frames_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_skipped_to_sync(&self) {
        self.counters
            .frames_skipped_to_sync
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_returned(&self, held_for: Duration) {
        self.counters.frames_returned.fetch_add(1, Ordering::Relaxed);
        self.counters
            .hold_time_us
            .fetch_add(held_for.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn erroneous_event(&self) {
        self.counters.erroneous_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_clients(&self, clients: usize) {
        self.counters
            .peak_clients
            .fetch_max(clients as u64, Ordering::Relaxed);
    }

    pub fn observe_frames_in_flight(&self, frames: usize) {
        self.counters
            .peak_frames_in_flight
            .fetch_max(frames as u64, Ordering::Relaxed);
    }

    pub fn lifetime(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn snapshot(&self, buffer_quota: u32, clients: usize) -> UsageSnapshot {
        let c = &self.counters;
        let frames_returned = c.frames_returned.load(Ordering::Relaxed);
        let hold_time_us = c.hold_time_us.load(Ordering::Relaxed);
        UsageSnapshot {
            frames_received: c.frames_received.load(Ordering::Relaxed),
            frames_ignored: c.frames_ignored.load(Ordering::Relaxed),
            frames_skipped_to_sync: c.frames_skipped_to_sync.load(Ordering::Relaxed),
            frames_returned,
            erroneous_events: c.erroneous_events.load(Ordering::Relaxed),
            peak_clients: c.peak_clients.load(Ordering::Relaxed),
            peak_frames_in_flight: c.peak_frames_in_flight.load(Ordering::Relaxed),
            mean_hold_time_us: hold_time_us.checked_div(frames_returned).unwrap_or(0),
            buffer_quota,
            clients: clients as u64,
            uptime_ms: self.created_at.elapsed().as_millis() as u64,
        }
    }
}

/// Value copy of a device's usage at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub frames_received: u64,
    pub frames_ignored: u64,
    pub frames_skipped_to_sync: u64,
    pub frames_returned: u64,
    pub erroneous_events: u64,
    pub peak_clients: u64,
    pub peak_frames_in_flight: u64,
    pub mean_hold_time_us: u64,
    pub buffer_quota: u32,
    pub clients: u64,
    pub uptime_ms: u64,
}

impl UsageSnapshot {
    /// Counter growth since `previous`; gauges keep their current value
    pub fn delta(&self, previous: &UsageSnapshot) -> UsageSnapshot {
        UsageSnapshot {
            frames_received: self.frames_received.saturating_sub(previous.frames_received),
            frames_ignored: self.frames_ignored.saturating_sub(previous.frames_ignored),
            frames_skipped_to_sync: self
                .frames_skipped_to_sync
                .saturating_sub(previous.frames_skipped_to_sync),
            frames_returned: self.frames_returned.saturating_sub(previous.frames_returned),
            erroneous_events: self
                .erroneous_events
                .saturating_sub(previous.erroneous_events),
            uptime_ms: self.uptime_ms.saturating_sub(previous.uptime_ms),
            ..*self
        }
    }
}

/// One collected sample
#[derive(Debug, Clone, Serialize)]
pub struct UsageSample {
    pub taken_at: SystemTime,
    pub snapshot: UsageSnapshot,
    pub delta: UsageSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_counters_and_mean_hold_time() {
        let stats = UsageStats::default();
        stats.frame_received();
        stats.frame_received();
        stats.frame_skipped_to_sync();
        stats.frame_returned(Duration::from_micros(100));
        stats.frame_returned(Duration::from_micros(300));
        stats.observe_clients(3);
        stats.observe_clients(1);

        let snap = stats.snapshot(4, 1);
        assert_eq!(snap.frames_received, 2);
        assert_eq!(snap.frames_skipped_to_sync, 1);
        assert_eq!(snap.frames_returned, 2);
        assert_eq!(snap.mean_hold_time_us, 200);
        assert_eq!(snap.peak_clients, 3);
        assert_eq!(snap.buffer_quota, 4);
    }

    #[test]
    fn delta_subtracts_counters_only() {
        let before = UsageSnapshot {
            frames_received: 10,
            frames_returned: 8,
            peak_clients: 2,
            buffer_quota: 3,
            ..Default::default()
        };
        let after = UsageSnapshot {
            frames_received: 25,
            frames_returned: 20,
            peak_clients: 4,
            buffer_quota: 5,
            ..Default::default()
        };
        let delta = after.delta(&before);
        assert_eq!(delta.frames_received, 15);
        assert_eq!(delta.frames_returned, 12);
        assert_eq!(delta.peak_clients, 4);
        assert_eq!(delta.buffer_quota, 5);
    }
}
