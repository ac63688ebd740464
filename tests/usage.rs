mod common;

use std::sync::Arc;
use std::time::Duration;

use argus::hardware::ScriptedProvider;
use argus::stats::CollectionMode;
use argus::{ChannelSink, DeviceId, DumpTarget};
use common::*;

#[test]
fn live_devices_are_sampled_until_retired() {
    let provider = ScriptedProvider::with_cameras(&["cam0"]);
    let camera = provider.camera("cam0").unwrap();
    let (broker, _) = broker_with(provider, test_config());
    let id: DeviceId = "cam0".into();

    let client = broker.open_client("cam0").unwrap();
    let (sink, rx) = ChannelSink::new();
    client.start_stream(Arc::new(sink)).unwrap();
    for i in 0..3 {
        camera.emit_frame(i, ms(u64::from(i) * 33));
        for frames in drain_frames(&rx) {
            client.done_with_frames(&frames).unwrap();
        }
    }

    wait_for(|| {
        broker
            .scheduler()
            .latest(&id)
            .unwrap()
            .is_some_and(|s| s.snapshot.frames_received == 3)
    });
    let latest = broker.scheduler().latest(&id).unwrap().unwrap();
    assert_eq!(latest.snapshot.frames_returned, 3);
    assert_eq!(latest.snapshot.clients, 1);
    assert!(broker.dump(DumpTarget::All).contains("periodic samples"));

    broker.close_client(&client).unwrap();
    assert!(broker.scheduler().history(&id).unwrap().is_empty());

    // A new session on the same camera starts from scratch
    let _client = broker.open_client("cam0").unwrap();
    wait_for(|| !broker.scheduler().history(&id).unwrap().is_empty());
    let history = broker.scheduler().history(&id).unwrap();
    assert!(history.iter().all(|s| s.snapshot.frames_received == 0));
}

#[test]
fn custom_collection_through_broker() {
    let provider = ScriptedProvider::with_cameras(&["cam0", "cam1"]);
    let (broker, _) = broker_with(provider, test_config());
    let _a = broker.open_client("cam0").unwrap();
    let _b = broker.open_client("cam1").unwrap();

    let scheduler = broker.scheduler();
    scheduler
        .start_custom_collection(ms(5), Duration::from_secs(10))
        .unwrap();
    assert_eq!(scheduler.mode(), CollectionMode::Custom);
    std::thread::sleep(ms(50));

    let report = scheduler.stop_custom_collection(DumpTarget::All).unwrap();
    assert_eq!(report.len(), 2);
    assert!(report.values().all(|samples| !samples.is_empty()));
    assert_eq!(scheduler.mode(), CollectionMode::Periodic);
}

#[test]
fn reload_applies_to_next_frame() {
    let provider = ScriptedProvider::with_cameras(&["cam0"]);
    let camera = provider.camera("cam0").unwrap();
    let (broker, _) = broker_with(provider, test_config());
    let client = broker.open_client("cam0").unwrap();
    client.set_max_frames_in_flight(8).unwrap();
    let (sink, rx) = ChannelSink::new();
    client.start_stream(Arc::new(sink)).unwrap();

    camera.emit_frame(0, ms(0));
    camera.emit_frame(1, ms(5));
    assert_eq!(drain_frames(&rx).len(), 2);

    let mut config = test_config();
    config.device.skip_threshold_us = 16_000;
    broker.reload_config(config);
    assert_eq!(broker.config().device.skip_threshold_us, 16_000);

    camera.emit_frame(2, ms(10));
    assert!(drain_frames(&rx).is_empty());
    camera.emit_frame(3, ms(25));
    assert_eq!(drain_frames(&rx).len(), 1);
}
