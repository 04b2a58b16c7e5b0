//! Running occupancy totals and the snapshot cadence.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Point-in-time copy of the aggregate counters.
///
/// `current_inside == total_entered - total_exited + baseline_inside - vanished_inside`
/// holds for every snapshot whose `discrepancies` is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub total_entered: u64,
    pub total_exited: u64,
    pub current_inside: u64,
    /// Number of track records currently held.
    pub total_tracked: u64,
    /// Tracks first observed already inside the region.
    pub baseline_inside: u64,
    /// Tracks reaped while inside the region.
    pub vanished_inside: u64,
    /// Decrements that would have driven `current_inside` below zero.
    pub discrepancies: u64,
    pub frames_processed: u64,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct AggregateCounters {
    total_entered: u64,
    total_exited: u64,
    current_inside: u64,
    baseline_inside: u64,
    vanished_inside: u64,
    discrepancies: u64,
}

impl AggregateCounters {
    pub(crate) fn current_inside(&self) -> u64 {
        self.current_inside
    }

    /// A track was first observed inside the region.
    pub(crate) fn record_baseline(&mut self) {
        self.baseline_inside += 1;
        self.current_inside += 1;
    }

    pub(crate) fn record_entry(&mut self) {
        self.total_entered += 1;
        self.current_inside += 1;
    }

    pub(crate) fn record_exit(&mut self) {
        self.total_exited += 1;
        self.decrement_inside("exit");
    }

    /// A track disappeared from the tracker while inside the region.
    pub(crate) fn record_vanished(&mut self) {
        self.vanished_inside += 1;
        self.decrement_inside("vanish");
    }

    fn decrement_inside(&mut self, cause: &'static str) {
        match self.current_inside.checked_sub(1) {
            Some(next) => self.current_inside = next,
            None => {
                self.discrepancies += 1;
                warn!(
                    cause,
                    discrepancies = self.discrepancies,
                    "occupancy would go negative; clamped to zero"
                );
            }
        }
    }

    pub(crate) fn snapshot(&self, total_tracked: usize, frames_processed: u64) -> Snapshot {
        Snapshot {
            total_entered: self.total_entered,
            total_exited: self.total_exited,
            current_inside: self.current_inside,
            total_tracked: total_tracked as u64,
            baseline_inside: self.baseline_inside,
            vanished_inside: self.vanished_inside,
            discrepancies: self.discrepancies,
            frames_processed,
        }
    }
}

/// Decides when a caller should push a snapshot to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotCadence {
    every_frames: u64,
}

impl SnapshotCadence {
    /// `every_frames == 0` disables periodic snapshots.
    pub fn every(every_frames: u64) -> Self {
        Self { every_frames }
    }

    pub fn is_due(&self, frames_processed: u64) -> bool {
        self.every_frames != 0 && frames_processed != 0 && frames_processed % self.every_frames == 0
    }
}

impl Default for SnapshotCadence {
    fn default() -> Self {
        Self::every(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrement_clamps_and_flags() {
        let mut counters = AggregateCounters::default();
        counters.record_exit();
        counters.record_vanished();
        let snap = counters.snapshot(0, 0);
        assert_eq!(snap.current_inside, 0);
        assert_eq!(snap.total_exited, 1);
        assert_eq!(snap.discrepancies, 2);
    }

    #[test]
    fn balanced_counts() {
        let mut counters = AggregateCounters::default();
        counters.record_baseline();
        counters.record_entry();
        counters.record_entry();
        counters.record_exit();
        counters.record_vanished();
        let s = counters.snapshot(3, 10);
        assert_eq!(s.current_inside, 1);
        assert_eq!(
            s.current_inside,
            s.total_entered - s.total_exited + s.baseline_inside - s.vanished_inside
        );
        assert_eq!(s.total_tracked, 3);
        assert_eq!(s.discrepancies, 0);
    }

    #[test]
    fn cadence() {
        let cadence = SnapshotCadence::every(100);
        assert!(!cadence.is_due(0));
        assert!(!cadence.is_due(99));
        assert!(cadence.is_due(100));
        assert!(cadence.is_due(200));
        assert!(!SnapshotCadence::every(0).is_due(100));
    }
}
