//! Double-buffered frame requests.
//!
//! Requests collect in the `next` queue. When a frame arrives the roles swap
//! and the delivery path drains `current`, so a request issued while a frame is
//! being fanned out waits for the following frame.

use std::collections::VecDeque;
use std::sync::Weak;
use std::time::Duration;

use super::client::{ClientId, ClientSession};

/// A client's standing request for the next frame
#[derive(Debug, Clone)]
pub struct FrameRequest {
    pub client_id: ClientId,
    pub client: Weak<ClientSession>,
    /// Timestamp of the last frame this client was given, if any
    pub last_timestamp: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    A,
    B,
}

#[derive(Debug)]
pub struct RequestQueues {
    a: VecDeque<FrameRequest>,
    b: VecDeque<FrameRequest>,
    current: Role,
}

impl Default for RequestQueues {
    fn default() -> Self {
        Self {
            a: VecDeque::new(),
            b: VecDeque::new(),
            current: Role::A,
        }
    }
}

impl RequestQueues {
    fn next_mut(&mut self) -> &mut VecDeque<FrameRequest> {
        match self.current {
            Role::A => &mut self.b,
            Role::B => &mut self.a,
        }
    }

    fn current_mut(&mut self) -> &mut VecDeque<FrameRequest> {
        match self.current {
            Role::A => &mut self.a,
            Role::B => &mut self.b,
        }
    }

    /// Queue a request for the next frame. A client has at most one pending
    /// request; asking again only refreshes its timestamp.
    pub fn push(&mut self, request: FrameRequest) {
        let next = self.next_mut();
        match next.iter_mut().find(|r| r.client_id == request.client_id) {
            Some(existing) => existing.last_timestamp = request.last_timestamp,
            None => next.push_back(request),
        }
    }

    /// Swap roles and take everything that was pending
    pub fn swap_and_take(&mut self) -> VecDeque<FrameRequest> {
        self.current = match self.current {
            Role::A => Role::B,
            Role::B => Role::A,
        };
        std::mem::take(self.current_mut())
    }

    /// Put back requests that could not be served by this frame
    pub fn defer(&mut self, deferred: impl IntoIterator<Item = FrameRequest>) {
        for request in deferred {
            self.push(request);
        }
    }

    /// Drop every pending request from one client
    pub fn purge(&mut self, client_id: ClientId) {
        self.a.retain(|r| r.client_id != client_id);
        self.b.retain(|r| r.client_id != client_id);
    }

    pub fn pending(&self) -> usize {
        self.a.len() + self.b.len()
    }
}
