//! Track lifecycle reaping.
//!
//! Ids that the tracker no longer reports are removed. A track lost while
//! inside the region lowers occupancy but is not an exit: nothing crossed the
//! boundary, so no event is produced.

use std::collections::HashSet;

use tracing::debug;

use crate::{
    counters::AggregateCounters,
    track_store::{TrackId, TrackRecord, TrackStore},
};

/// Remove every record whose id is not in `active` and return the removed
/// records.
pub(crate) fn reap_stale(
    tracks: &mut TrackStore,
    counters: &mut AggregateCounters,
    active: &HashSet<TrackId>,
) -> Vec<TrackRecord> {
    let stale = tracks.stale_ids(active);
    let mut reaped = Vec::with_capacity(stale.len());
    for track_id in stale {
        let Some(record) = tracks.remove(track_id) else {
            continue;
        };
        if record.inside {
            counters.record_vanished();
        }
        debug!(
            track_id,
            inside = record.inside,
            last_seen_frame = record.last_seen_frame,
            "reaped stale track"
        );
        reaped.push(record);
    }
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Point;

    #[test]
    fn vanished_inside_track_lowers_occupancy() {
        let mut tracks = TrackStore::new();
        let mut counters = AggregateCounters::default();
        tracks.get_or_create(1, Point::new(5.0, 5.0), true, 1);
        counters.record_baseline();
        tracks.get_or_create(2, Point::new(50.0, 50.0), false, 1);

        let active: HashSet<TrackId> = HashSet::new();
        let mut reaped = reap_stale(&mut tracks, &mut counters, &active);
        reaped.sort_by_key(|r| r.track_id);

        assert_eq!(reaped.len(), 2);
        assert!(tracks.is_empty());
        let s = counters.snapshot(tracks.len(), 0);
        assert_eq!(s.current_inside, 0);
        assert_eq!(s.vanished_inside, 1);
        assert_eq!(s.total_exited, 0);
    }

    #[test]
    fn active_tracks_survive() {
        let mut tracks = TrackStore::new();
        let mut counters = AggregateCounters::default();
        tracks.get_or_create(1, Point::new(5.0, 5.0), true, 1);
        counters.record_baseline();

        let active: HashSet<TrackId> = [1].into_iter().collect();
        assert!(reap_stale(&mut tracks, &mut counters, &active).is_empty());
        assert_eq!(counters.current_inside(), 1);
    }
}
