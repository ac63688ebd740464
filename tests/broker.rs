mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use argus::hardware::ScriptedProvider;
use argus::stats::UsageSource;
use argus::{
    Broker, BrokerError, CameraParam, ChannelSink, DumpTarget, PixelFormat, StreamConfig,
    StreamEvent,
};
use common::*;

#[test]
fn aggregate_quota_follows_clients() {
    let provider = ScriptedProvider::with_cameras(&["cam0"]);
    let camera = provider.camera("cam0").unwrap();
    let mut config = test_config();
    config.device.default_buffer_quota = 3;
    let (broker, _) = broker_with(provider, config);

    let a = broker.open_client("cam0").unwrap();
    a.set_max_frames_in_flight(2).unwrap();
    let b = broker.open_client("cam0").unwrap();
    b.set_max_frames_in_flight(2).unwrap();
    assert_eq!(broker.with_device("cam0", |d| d.buffer_quota()), Some(4));

    broker.close_client(&b).unwrap();
    assert_eq!(broker.with_device("cam0", |d| d.buffer_quota()), Some(2));
    assert_eq!(camera.quota_history(), vec![3, 1, 2, 3, 4, 2]);
}

#[test]
fn one_session_per_camera() {
    let provider = ScriptedProvider::with_cameras(&["cam0", "cam1"]);
    let cam0 = provider.camera("cam0").unwrap();
    let (broker, _) = broker_with(provider, test_config());

    let clients: Vec<_> = (0..3).map(|_| broker.open_client("cam0").unwrap()).collect();
    assert_eq!(cam0.open_count(), 1);
    assert_eq!(broker.active_devices().len(), 1);
    assert_eq!(broker.with_device("cam0", |d| d.client_count()), Some(3));
    drop(clients);
}

#[test]
fn last_close_retires_device_and_emits_telemetry() {
    let provider = ScriptedProvider::with_cameras(&["cam0"]);
    let camera = provider.camera("cam0").unwrap();
    let (broker, telemetry) = broker_with(provider, test_config());

    let a = broker.open_client("cam0").unwrap();
    let b = broker.open_client("cam0").unwrap();
    let (sink, _rx) = ChannelSink::new();
    a.start_stream(Arc::new(sink)).unwrap();
    assert!(camera.emit_frame(1, ms(0)));

    broker.close_client(&a).unwrap();
    assert!(camera.is_open());
    assert_eq!(camera.returned_buffers(), vec![1]);

    // Dropping the last client retires the device just like closing it
    drop(b);
    assert!(!camera.is_open());
    assert!(broker.active_devices().is_empty());

    let records = telemetry.0.lock();
    assert_eq!(records.len(), 1);
    assert_eq!(&*records[0].device_id, "cam0");
    assert_eq!(records[0].snapshot.frames_received, 1);
    assert_eq!(records[0].snapshot.frames_returned, 1);
}

#[test]
fn force_master_revokes_previous_master() {
    let provider = ScriptedProvider::with_cameras(&["cam0"]);
    let (broker, _) = broker_with(provider, test_config());
    let a = broker.open_client("cam0").unwrap();
    let b = broker.open_client("cam0").unwrap();
    let (sink_a, rx_a) = ChannelSink::new();
    let (sink_b, rx_b) = ChannelSink::new();
    a.start_stream(Arc::new(sink_a)).unwrap();
    b.start_stream(Arc::new(sink_b)).unwrap();
    drain_events(&rx_a);
    drain_events(&rx_b);

    a.set_master().unwrap();
    b.force_master().unwrap();
    assert!(b.is_master());
    assert!(drain_events(&rx_a)
        .iter()
        .any(|e| matches!(e, StreamEvent::MasterReleased { .. })));
    assert!(drain_events(&rx_b).is_empty());

    b.set_parameter(CameraParam::Brightness, 40).unwrap();
    match a.set_parameter(CameraParam::Brightness, 80) {
        Err(BrokerError::Rejected { current, .. }) => assert_eq!(current, Some(40)),
        other => panic!("unexpected {other:?}"),
    }

    // Leaving frees the role for everyone
    broker.close_client(&b).unwrap();
    assert!(drain_events(&rx_a)
        .iter()
        .any(|e| matches!(e, StreamEvent::MasterReleased { .. })));
    a.set_master().unwrap();
}

#[test]
fn buffer_returns_on_last_done_call() {
    let provider = ScriptedProvider::with_cameras(&["cam0"]);
    let camera = provider.camera("cam0").unwrap();
    let (broker, _) = broker_with(provider, test_config());

    const CLIENTS: usize = 4;
    let clients: Vec<_> = (0..CLIENTS)
        .map(|_| broker.open_client("cam0").unwrap())
        .collect();
    let (sink, _rx) = ChannelSink::new();
    let sink = Arc::new(sink);

    for accepting in 1..=CLIENTS {
        for (i, client) in clients.iter().enumerate() {
            client.stop_stream();
            if i < accepting {
                client.start_stream(sink.clone()).unwrap();
            }
        }
        let frame_id = accepting as u32 * 10;
        let ts = ms(accepting as u64 * 100);
        assert!(camera.emit_frame(frame_id, ts));
        assert_eq!(
            broker.with_device("cam0", |d| d.ref_count(frame_id)),
            Some(accepting as u32)
        );

        for client in &clients[..accepting] {
            assert!(!camera.returned_buffers().contains(&frame_id));
            client.done_with_frame(frame_id).unwrap();
        }
        assert_eq!(
            camera
                .returned_buffers()
                .iter()
                .filter(|id| **id == frame_id)
                .count(),
            1
        );
    }
}

#[test]
fn close_frames_are_deferred_never_lost() {
    let provider = ScriptedProvider::with_cameras(&["cam0"]);
    let camera = provider.camera("cam0").unwrap();
    let mut config = test_config();
    config.device.skip_threshold_us = 16_000;
    let (broker, _) = broker_with(provider, config);

    let client = broker.open_client("cam0").unwrap();
    client.set_max_frames_in_flight(32).unwrap();
    let (sink, rx) = ChannelSink::new();
    client.start_stream(Arc::new(sink)).unwrap();

    for i in 0..=10u32 {
        assert!(camera.emit_frame(i, ms(u64::from(i) * 10)));
    }
    let delivered: Vec<_> = drain_frames(&rx)
        .into_iter()
        .map(|frames| frames[0].timestamp)
        .collect();
    assert_eq!(delivered, [0, 20, 40, 60, 80, 100].map(ms).to_vec());
    assert_eq!(
        broker.with_device("cam0", |d| d.usage_snapshot().frames_skipped_to_sync),
        Some(5)
    );
}

#[test]
fn explicit_config_must_match_live_session() {
    let provider = ScriptedProvider::with_cameras(&["cam0"]);
    let camera = provider.camera("cam0").unwrap();
    let (broker, _) = broker_with(provider, test_config());

    let hd = StreamConfig {
        width: 1280,
        height: 720,
        fps: 30,
        format: PixelFormat::Nv12,
    };
    let _a = broker.open_client_with("cam0", &hd).unwrap();
    assert_eq!(camera.opened_with(), Some(hd));

    let _same = broker.open_client_with("cam0", &hd).unwrap();
    assert!(matches!(
        broker.open_client_with("cam0", &StreamConfig::default()),
        Err(BrokerError::Busy(_))
    ));
    // Without an explicit configuration the live one is shared
    let _any = broker.open_client("cam0").unwrap();
    assert_eq!(broker.with_device("cam0", |d| d.client_count()), Some(3));
}

#[test]
fn failures_are_reported_and_leave_no_session() {
    let provider = ScriptedProvider::with_cameras(&["cam0"]);
    let camera = provider.camera("cam0").unwrap();
    let (broker, _) = broker_with(provider, test_config());

    assert!(matches!(
        broker.open_client("nope"),
        Err(BrokerError::NotFound(_))
    ));

    camera.fail_open(true);
    assert!(matches!(
        broker.open_client("cam0"),
        Err(BrokerError::Hardware(_))
    ));
    assert!(broker.active_devices().is_empty());

    camera.fail_open(false);
    camera.limit_quota(1);
    let _a = broker.open_client("cam0").unwrap();
    assert!(matches!(
        broker.open_client("cam0"),
        Err(BrokerError::Rejected { .. })
    ));
    assert_eq!(broker.with_device("cam0", |d| d.client_count()), Some(1));
}

#[test]
fn unauthorized_callers_are_refused() {
    let allowed = Arc::new(AtomicBool::new(true));
    let flag = allowed.clone();
    let broker = Broker::builder(ScriptedProvider::with_cameras(&["cam0"]))
        .config(test_config())
        .access_policy(move || flag.load(Ordering::Relaxed))
        .build()
        .unwrap();

    let client = broker.open_client("cam0").unwrap();
    allowed.store(false, Ordering::Relaxed);
    assert!(matches!(
        broker.open_client("cam0"),
        Err(BrokerError::PermissionDenied)
    ));
    assert!(matches!(
        broker.camera_list(),
        Err(BrokerError::PermissionDenied)
    ));
    assert!(matches!(
        broker.close_client(&client),
        Err(BrokerError::PermissionDenied)
    ));
    assert_eq!(broker.active_devices().len(), 1);

    allowed.store(true, Ordering::Relaxed);
    broker.close_client(&client).unwrap();
    assert!(broker.active_devices().is_empty());
}

#[test]
fn unexpected_stop_reaches_clients() {
    let provider = ScriptedProvider::with_cameras(&["cam0"]);
    let camera = provider.camera("cam0").unwrap();
    let (broker, _) = broker_with(provider, test_config());
    let client = broker.open_client("cam0").unwrap();
    let (sink, rx) = ChannelSink::new();
    client.start_stream(Arc::new(sink)).unwrap();

    camera.emit_event(argus::HardwareEvent::FrameDropped);
    camera.emit_event(argus::HardwareEvent::StreamStopped);
    let events = drain_events(&rx);
    assert!(events.contains(&StreamEvent::StreamStarted));
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::FrameDropped { .. })));
    assert_eq!(events.last(), Some(&StreamEvent::StreamStopped));
    assert!(!client.is_streaming());

    // The client may start again
    let (sink, _rx) = ChannelSink::new();
    client.start_stream(Arc::new(sink)).unwrap();
    assert!(camera.is_streaming());
}

#[test]
fn enumeration_and_dump() {
    let provider = ScriptedProvider::with_cameras(&["front", "rear"]);
    provider.add_logical("both", &["front", "rear"]);
    let (broker, _) = broker_with(provider, test_config());

    let cameras = broker.camera_list().unwrap();
    assert_eq!(cameras.len(), 3);
    assert!(cameras.iter().any(|c| c.is_logical() && c.physical_ids.len() == 2));

    let _front = broker.open_client("front").unwrap();
    let dump = broker.dump(DumpTarget::All);
    assert!(dump.contains("1 live devices"));
    assert!(dump.contains("front: stopped"));
    assert!(!broker.dump(DumpTarget::Device("rear".into())).contains("front:"));
}

#[test]
fn shutdown_leaves_clients_harmless() {
    let provider = ScriptedProvider::with_cameras(&["cam0"]);
    let camera = provider.camera("cam0").unwrap();
    let (broker, telemetry) = broker_with(provider, test_config());
    let client = broker.open_client("cam0").unwrap();
    let (sink, _rx) = ChannelSink::new();
    client.start_stream(Arc::new(sink)).unwrap();
    camera.emit_frame(3, ms(0));

    broker.shutdown();
    assert!(!camera.is_open());
    assert_eq!(camera.returned_buffers(), vec![3]);
    assert_eq!(telemetry.0.lock().len(), 1);

    assert!(!client.is_streaming());
    assert_eq!(client.set_parameter(CameraParam::AbsoluteZoom, 2).unwrap(), 2);
    client.done_with_frame(3).unwrap();
    drop(client);
    assert_eq!(camera.returned_buffers(), vec![3]);
}
