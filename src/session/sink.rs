use flume::{Receiver, Sender};

use crate::hardware::{CameraParam, DeviceId, FrameBuffer};

/// Notifications a client receives alongside its frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    StreamStarted,
    StreamStopped,
    /// A frame was withheld because the client already holds its quota
    FrameDropped { device_id: DeviceId },
    /// The device or the aggregation wait timed out
    Timeout { device_id: Option<DeviceId> },
    ParameterChanged {
        device_id: DeviceId,
        param: CameraParam,
        value: i32,
    },
    /// The master role on this device is free to be claimed
    MasterReleased { device_id: DeviceId },
}

/// Where a client session forwards frames and events.
///
/// Called from hardware delivery threads and capture workers; implementations
/// must hand off quickly and never block.
pub trait FrameSink: Send + Sync {
    /// One frame for a physical client, one frame per device for a logical one
    fn deliver_frames(&self, frames: Vec<FrameBuffer>);

    fn notify(&self, event: StreamEvent);
}

#[derive(Debug, Clone)]
pub enum SinkMessage {
    Frames(Vec<FrameBuffer>),
    Event(StreamEvent),
}

/// Sink that queues everything on an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<SinkMessage>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<SinkMessage>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn deliver_frames(&self, frames: Vec<FrameBuffer>) {
        // A disconnected receiver means the consumer is gone; frames are
        // still returned through the session on teardown
        let _ = self.tx.send(SinkMessage::Frames(frames));
    }

    fn notify(&self, event: StreamEvent) {
        let _ = self.tx.send(SinkMessage::Event(event));
    }
}
