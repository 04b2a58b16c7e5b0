//! Per-track membership state keyed by tracker identifier.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::region::Point;

/// Opaque identifier assigned by the upstream tracker.
pub type TrackId = i64;

/// Last known state of one tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrackRecord {
    pub track_id: TrackId,
    /// Membership at the most recent valid observation.
    pub inside: bool,
    pub last_position: Point,
    pub first_seen_frame: u64,
    pub last_seen_frame: u64,
}

/// Mapping from track id to [`TrackRecord`].
///
/// Records are only ever removed through [`TrackStore::remove`] or
/// [`TrackStore::clear`]; there is no implicit eviction.
#[derive(Debug, Default)]
pub struct TrackStore {
    records: HashMap<TrackId, TrackRecord>,
}

impl TrackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the record for `track_id`, creating it with `inside` as its
    /// initial membership when the id has not been seen before.
    ///
    /// The boolean is `true` when the record was created by this call.
    pub fn get_or_create(
        &mut self,
        track_id: TrackId,
        position: Point,
        inside: bool,
        frame_number: u64,
    ) -> (&mut TrackRecord, bool) {
        let mut created = false;
        let record = self.records.entry(track_id).or_insert_with(|| {
            created = true;
            TrackRecord {
                track_id,
                inside,
                last_position: position,
                first_seen_frame: frame_number,
                last_seen_frame: frame_number,
            }
        });
        (record, created)
    }

    /// Overwrite membership and position of an existing record.
    ///
    /// Returns the record as it was before the update, or `None` when the id is
    /// unknown.
    pub fn update(
        &mut self,
        track_id: TrackId,
        position: Point,
        inside: bool,
        frame_number: u64,
    ) -> Option<TrackRecord> {
        let record = self.records.get_mut(&track_id)?;
        let previous = *record;
        record.inside = inside;
        record.last_position = position;
        record.last_seen_frame = frame_number;
        Some(previous)
    }

    pub fn remove(&mut self, track_id: TrackId) -> Option<TrackRecord> {
        self.records.remove(&track_id)
    }

    pub fn get(&self, track_id: TrackId) -> Option<&TrackRecord> {
        self.records.get(&track_id)
    }

    pub fn contains(&self, track_id: TrackId) -> bool {
        self.records.contains_key(&track_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records currently marked as inside the region.
    pub fn inside_count(&self) -> usize {
        self.records.values().filter(|r| r.inside).count()
    }

    /// Ids present in the store but absent from `active`.
    pub fn stale_ids(&self, active: &HashSet<TrackId>) -> Vec<TrackId> {
        self.records
            .keys()
            .filter(|id| !active.contains(id))
            .copied()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackRecord> {
        self.records.values()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_seeds_membership_once() {
        let mut store = TrackStore::new();
        let (record, created) = store.get_or_create(7, Point::new(1.0, 2.0), true, 3);
        assert!(created);
        assert!(record.inside);
        assert_eq!(record.first_seen_frame, 3);

        let (record, created) = store.get_or_create(7, Point::new(50.0, 50.0), false, 4);
        assert!(!created);
        assert!(record.inside, "existing record must not be reseeded");
        assert_eq!(record.last_position, Point::new(1.0, 2.0));
    }

    #[test]
    fn update_returns_previous_state() {
        let mut store = TrackStore::new();
        store.get_or_create(1, Point::new(0.0, 0.0), false, 1);

        let previous = store.update(1, Point::new(5.0, 5.0), true, 2).unwrap();
        assert!(!previous.inside);
        let current = store.get(1).unwrap();
        assert!(current.inside);
        assert_eq!(current.last_position, Point::new(5.0, 5.0));
        assert_eq!(current.last_seen_frame, 2);

        assert!(store.update(99, Point::new(0.0, 0.0), true, 2).is_none());
        assert!(!store.contains(99));
    }

    #[test]
    fn stale_ids_and_remove() {
        let mut store = TrackStore::new();
        for id in 1..=3 {
            store.get_or_create(id, Point::default(), id == 2, 1);
        }
        let active: HashSet<TrackId> = [1, 3].into_iter().collect();
        assert_eq!(store.stale_ids(&active), vec![2]);
        assert_eq!(store.inside_count(), 1);

        let removed = store.remove(2).unwrap();
        assert!(removed.inside);
        assert_eq!(store.len(), 2);
        assert_eq!(store.inside_count(), 0);
        assert!(store.remove(2).is_none());
    }
}
