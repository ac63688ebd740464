//! Device and client sessions.
//!
//! Ownership runs one way: the broker owns device sessions; device sessions
//! and client sessions only hold weak references to each other. Resolving a
//! dead weak reference is routine and turns the operation into a no-op.
//!
//! Lock order is client state before device state. A device session never
//! calls into a client while holding its own state lock.

pub mod client;
pub mod device;
pub mod ledger;
pub mod requests;
pub mod sink;

use std::fmt;

pub use client::{ClientId, ClientOptions, ClientSession};
pub use device::DeviceSession;
pub use ledger::{BufferLedger, FrameRecord, Release};
pub use requests::{FrameRequest, RequestQueues};
pub use sink::{ChannelSink, FrameSink, SinkMessage, StreamEvent};

/// Streaming state shared by device and client sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Stopped,
    Running,
    Stopping,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Stopped => "stopped",
            StreamState::Running => "running",
            StreamState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}
