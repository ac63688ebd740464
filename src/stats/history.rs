//! Bounded ring of usage samples

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use super::UsageSample;

/// Fixed-capacity sample history; the oldest sample is evicted when full
pub struct SampleRing {
    ring: HeapRb<UsageSample>,
    evicted: u64,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
            evicted: 0,
        }
    }

    pub fn push(&mut self, sample: UsageSample) {
        if self.ring.push_overwrite(sample).is_some() {
            self.evicted += 1;
        }
    }

    pub fn latest(&self) -> Option<&UsageSample> {
        self.ring.iter().last()
    }

    /// Oldest first
    pub fn to_vec(&self) -> Vec<UsageSample> {
        self.ring.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::UsageSnapshot;
    use std::time::SystemTime;

    fn sample(received: u64) -> UsageSample {
        let snapshot = UsageSnapshot {
            frames_received: received,
            ..Default::default()
        };
        UsageSample {
            taken_at: SystemTime::now(),
            snapshot,
            delta: snapshot,
        }
    }

    #[test]
    fn keeps_most_recent_samples() {
        let mut ring = SampleRing::new(3);
        assert!(ring.is_empty());
        for i in 1..=5 {
            ring.push(sample(i));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.evicted(), 2);
        let received: Vec<_> = ring.to_vec().iter().map(|s| s.snapshot.frames_received).collect();
        assert_eq!(received, vec![3, 4, 5]);
        assert_eq!(ring.latest().map(|s| s.snapshot.frames_received), Some(5));
    }
}
