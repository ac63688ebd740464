#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use argus::hardware::ScriptedProvider;
use argus::{Broker, Config, FrameBuffer, SinkMessage, StreamEvent, TelemetryRecord, TelemetrySink};
use parking_lot::Mutex;

/// Telemetry sink that keeps every record for inspection
#[derive(Clone, Default)]
pub struct RecordedTelemetry(pub Arc<Mutex<Vec<TelemetryRecord>>>);

impl TelemetrySink for RecordedTelemetry {
    fn emit(&self, record: &TelemetryRecord) -> color_eyre::Result<()> {
        self.0.lock().push(record.clone());
        Ok(())
    }
}

/// Config with the anti-thrash threshold disabled and fast usage sampling
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.device.skip_threshold_us = 0;
    config.stats.periodic_interval_ms = 10;
    config.stats.min_custom_interval_ms = 5;
    config
}

pub fn broker_with(provider: ScriptedProvider, config: Config) -> (Broker, RecordedTelemetry) {
    let telemetry = RecordedTelemetry::default();
    let broker = Broker::builder(provider)
        .config(config)
        .telemetry(telemetry.clone())
        .build()
        .unwrap();
    (broker, telemetry)
}

pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

pub fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(ms(2));
    }
}

/// Frame deliveries already queued on a sink channel
pub fn drain_frames(rx: &flume::Receiver<SinkMessage>) -> Vec<Vec<FrameBuffer>> {
    rx.try_iter()
        .filter_map(|m| match m {
            SinkMessage::Frames(frames) => Some(frames),
            SinkMessage::Event(_) => None,
        })
        .collect()
}

pub fn drain_events(rx: &flume::Receiver<SinkMessage>) -> Vec<StreamEvent> {
    rx.try_iter()
        .filter_map(|m| match m {
            SinkMessage::Event(event) => Some(event),
            SinkMessage::Frames(_) => None,
        })
        .collect()
}

/// Block for the next frame delivery, skipping events
pub fn next_frames(rx: &flume::Receiver<SinkMessage>) -> Vec<FrameBuffer> {
    loop {
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            SinkMessage::Frames(frames) => return frames,
            SinkMessage::Event(_) => continue,
        }
    }
}
