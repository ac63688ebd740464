//! Outstanding buffer bookkeeping for one device session.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::hardware::FrameId;

/// One buffer currently lent out by the hardware
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub frame_id: FrameId,
    pub ref_count: u32,
    pub arrived_at: Instant,
}

/// What happened when a reference was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Last holder let go; the buffer must go back to the hardware now
    Returned { held_for: Duration },
    /// Other holders remain
    Outstanding(u32),
    /// No live record for this frame id
    Unknown,
}

/// Reference counts of every buffer a device session has handed out.
///
/// Slots are reused once their count reaches zero, so the ledger never grows
/// past the peak number of simultaneously outstanding buffers.
#[derive(Debug, Default)]
pub struct BufferLedger {
    records: Vec<FrameRecord>,
}

impl BufferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly arrived buffer with a single reference
    pub fn acquire(&mut self, frame_id: FrameId) {
        if self.find(frame_id).is_some() {
            warn!("Buffer {} arrived while still outstanding", frame_id);
        }
        let record = FrameRecord {
            frame_id,
            ref_count: 1,
            arrived_at: Instant::now(),
        };
        match self.records.iter_mut().find(|r| r.ref_count == 0) {
            Some(slot) => *slot = record,
            None => self.records.push(record),
        }
    }

    /// Add a holder to an outstanding buffer
    pub fn add_ref(&mut self, frame_id: FrameId) -> bool {
        match self.find(frame_id) {
            Some(i) => {
                self.records[i].ref_count += 1;
                true
            }
            None => false,
        }
    }

    /// Drop one holder
    pub fn release(&mut self, frame_id: FrameId) -> Release {
        let Some(i) = self.find(frame_id) else {
            return Release::Unknown;
        };
        let record = &mut self.records[i];
        record.ref_count -= 1;
        if record.ref_count == 0 {
            Release::Returned {
                held_for: record.arrived_at.elapsed(),
            }
        } else {
            Release::Outstanding(record.ref_count)
        }
    }

    pub fn ref_count(&self, frame_id: FrameId) -> u32 {
        self.find(frame_id)
            .map(|i| self.records[i].ref_count)
            .unwrap_or(0)
    }

    /// Buffers with at least one holder
    pub fn outstanding(&self) -> usize {
        self.records.iter().filter(|r| r.ref_count > 0).count()
    }

    /// Forget every record, yielding the ids still owed to the hardware
    pub fn drain(&mut self) -> Vec<FrameId> {
        self.records
            .drain(..)
            .filter(|r| r.ref_count > 0)
            .map(|r| r.frame_id)
            .collect()
    }

    fn find(&self, frame_id: FrameId) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.ref_count > 0 && r.frame_id == frame_id)
    }
}
