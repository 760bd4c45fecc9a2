//! Bounded snapshot history with strictly increasing timestamps.

use std::collections::VecDeque;

use chrono::Duration;

use super::HardwareSnapshot;

/// Fixed-capacity ring of the most recent snapshots, oldest first.
#[derive(Debug, Clone)]
pub struct SnapshotRing {
    capacity: usize,
    buf: VecDeque<HardwareSnapshot>,
}

impl SnapshotRing {
    /// Create an empty ring. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, buf: VecDeque::with_capacity(capacity) }
    }

    /// Append a snapshot, evicting the oldest at capacity.
    ///
    /// A timestamp that is not after the newest entry is re-stamped one
    /// millisecond after it. Returns the snapshot as stored.
    pub fn push(&mut self, mut snapshot: HardwareSnapshot) -> HardwareSnapshot {
        if let Some(last) = self.buf.back() {
            if snapshot.timestamp <= last.timestamp {
                snapshot.timestamp = last.timestamp + Duration::milliseconds(1);
            }
        }
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(snapshot.clone());
        snapshot
    }

    /// Newest snapshot.
    pub fn latest(&self) -> Option<&HardwareSnapshot> {
        self.buf.back()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &HardwareSnapshot> {
        self.buf.iter()
    }

    /// Stored snapshots.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Maximum stored snapshots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
