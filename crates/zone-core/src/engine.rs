//! The occupancy engine for one camera/region pair.
//!
//! An [`OccupancyEngine`] owns its region, the track store, the aggregate
//! counters and the pending event queue. Frames must be fed in arrival order
//! from a single thread; callers that need concurrent reads should publish
//! [`OccupancyEngine::snapshot`] after each frame.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    counters::{AggregateCounters, Snapshot},
    crossing::{Observation, ObservationError, Transition, apply_observation},
    event::{CrossingEvent, CrossingKind, DEFAULT_MAX_PENDING_EVENTS, EventQueue},
    reaper::reap_stale,
    region::{Point, Region, RegionError},
    track_store::{TrackId, TrackRecord, TrackStore},
};

/// Outcome of processing one frame.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FrameReport {
    pub frame_number: u64,
    /// Events emitted while processing this frame, in observation order.
    pub events: Vec<CrossingEvent>,
    pub reaped: Vec<TrackRecord>,
    pub skipped: Vec<ObservationError>,
}

impl FrameReport {
    pub fn entered(&self) -> usize {
        self.count(CrossingKind::Entered)
    }

    pub fn exited(&self) -> usize {
        self.count(CrossingKind::Exited)
    }

    fn count(&self, kind: CrossingKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }
}

pub struct OccupancyEngine {
    region: Region,
    tracks: TrackStore,
    counters: AggregateCounters,
    events: EventQueue,
    frames_processed: u64,
}

impl OccupancyEngine {
    pub fn new(region: Region) -> Self {
        Self::with_event_capacity(region, DEFAULT_MAX_PENDING_EVENTS)
    }

    pub fn with_event_capacity(region: Region, max_pending_events: usize) -> Self {
        Self {
            region,
            tracks: TrackStore::new(),
            counters: AggregateCounters::default(),
            events: EventQueue::new(max_pending_events),
            frames_processed: 0,
        }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn tracks(&self) -> &TrackStore {
        &self.tracks
    }

    /// Feed a single observation. Emits at most one event.
    ///
    /// Prefer [`OccupancyEngine::process_frame`], which also reaps; this is the
    /// building block for callers that drive reaping themselves.
    pub fn observe(
        &mut self,
        observation: &Observation,
        frame_number: u64,
    ) -> Result<Option<CrossingEvent>, ObservationError> {
        let transition = apply_observation(
            &self.region,
            &mut self.tracks,
            &mut self.counters,
            observation,
            frame_number,
        )?;

        let Transition::Crossed(kind) = transition else {
            return Ok(None);
        };

        let event = CrossingEvent {
            track_id: observation.track_id,
            kind,
            timestamp: Utc::now(),
            frame_number,
            position: observation.position,
        };
        let snapshot = self.snapshot();
        info!(
            track_id = event.track_id,
            frame = frame_number,
            total_entered = snapshot.total_entered,
            total_exited = snapshot.total_exited,
            current_inside = snapshot.current_inside,
            "{kind}"
        );
        self.events.publish(event.clone());
        Ok(Some(event))
    }

    /// Remove tracks missing from `active`. Must run after every observation of
    /// the frame has been applied.
    pub fn reap(&mut self, active: &HashSet<TrackId>) -> Vec<TrackRecord> {
        reap_stale(&mut self.tracks, &mut self.counters, active)
    }

    /// Process every observation of one frame, then reconcile the active set.
    ///
    /// Invalid observations are skipped but still count as active, so a track
    /// with one bad reading keeps its state. Repeated ids within the frame are
    /// skipped after the first.
    pub fn process_frame(&mut self, frame_number: u64, observations: &[Observation]) -> FrameReport {
        let mut report = FrameReport {
            frame_number,
            ..FrameReport::default()
        };
        let mut active: HashSet<TrackId> = HashSet::with_capacity(observations.len());

        for observation in observations {
            if !active.insert(observation.track_id) {
                report.skipped.push(ObservationError::DuplicateInFrame {
                    track_id: observation.track_id,
                    frame_number,
                });
                continue;
            }
            match self.observe(observation, frame_number) {
                Ok(Some(event)) => report.events.push(event),
                Ok(None) => {}
                Err(err) => report.skipped.push(err),
            }
        }

        report.reaped = self.reap(&active);
        self.frames_processed += 1;

        for err in &report.skipped {
            warn!(frame = frame_number, "skipped observation: {err}");
        }
        debug_assert_eq!(
            self.counters.current_inside(),
            self.tracks.inside_count() as u64,
            "occupancy diverged from track records"
        );
        report
    }

    /// Aggregate totals as of the last fully processed observation.
    pub fn snapshot(&self) -> Snapshot {
        self.counters
            .snapshot(self.tracks.len(), self.frames_processed)
    }

    /// Return and clear every pending event.
    pub fn get_pending_events(&mut self) -> Vec<CrossingEvent> {
        self.events.drain()
    }

    pub fn pending_event_count(&self) -> usize {
        self.events.len()
    }

    /// Events discarded because the pending queue overflowed.
    pub fn dropped_event_count(&self) -> u64 {
        self.events.dropped()
    }

    /// Swap in a new region and hard-reset all state.
    ///
    /// Track records, counters and the frame count are cleared. Pending events
    /// are kept so they can still be drained. If `vertices` is invalid nothing
    /// changes and the error is returned.
    pub fn reload<I, P>(&mut self, vertices: I) -> Result<(), RegionError>
    where
        I: IntoIterator<Item = P>,
        P: Into<Point>,
    {
        let region = Region::new(vertices)?;
        self.replace_region(region);
        Ok(())
    }

    /// Same as [`OccupancyEngine::reload`] for an already validated region.
    pub fn replace_region(&mut self, region: Region) {
        let discarded = self.tracks.len();
        self.region = region;
        self.tracks.clear();
        self.counters = AggregateCounters::default();
        self.frames_processed = 0;
        debug!(discarded_tracks = discarded, "region reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Region {
        Region::new([(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]).unwrap()
    }

    fn obs(id: TrackId, x: f64, y: f64) -> Observation {
        Observation::new(id, Point::new(x, y))
    }

    #[test]
    fn square_scenario() {
        let mut engine = OccupancyEngine::new(square());

        // Track 1 first seen inside.
        let r = engine.process_frame(1, &[obs(1, 5.0, 5.0)]);
        assert!(r.events.is_empty());
        let s = engine.snapshot();
        assert_eq!((s.current_inside, s.total_entered), (1, 0));

        // Track 1 leaves; track 2 appears outside.
        let r = engine.process_frame(2, &[obs(1, 20.0, 20.0), obs(2, 20.0, 20.0)]);
        assert_eq!(r.exited(), 1);
        assert_eq!(r.events[0].track_id, 1);
        let s = engine.snapshot();
        assert_eq!((s.total_exited, s.current_inside), (1, 0));

        // Track 2 enters.
        let r = engine.process_frame(3, &[obs(1, 20.0, 20.0), obs(2, 5.0, 5.0)]);
        assert_eq!(r.entered(), 1);
        assert_eq!(r.events[0].kind, CrossingKind::Entered);
        let s = engine.snapshot();
        assert_eq!((s.total_entered, s.current_inside), (1, 1));
        let tracked_before = s.total_tracked;

        // Track 2 vanishes while inside.
        let r = engine.process_frame(4, &[obs(1, 20.0, 20.0)]);
        assert!(r.events.is_empty());
        assert_eq!(r.reaped.len(), 1);
        assert_eq!(r.reaped[0].track_id, 2);
        let s = engine.snapshot();
        assert_eq!(s.current_inside, 0);
        assert_eq!(s.total_tracked, tracked_before - 1);
        assert_eq!((s.total_entered, s.total_exited), (1, 1));

        let pending = engine.get_pending_events();
        let kinds: Vec<_> = pending.iter().map(|e| (e.track_id, e.kind)).collect();
        assert_eq!(
            kinds,
            vec![(1, CrossingKind::Exited), (2, CrossingKind::Entered)]
        );
        assert!(engine.get_pending_events().is_empty());
    }

    #[test]
    fn snapshot_is_idempotent() {
        let mut engine = OccupancyEngine::new(square());
        engine.process_frame(1, &[obs(1, 5.0, 5.0), obs(2, 50.0, 5.0)]);
        assert_eq!(engine.snapshot(), engine.snapshot());
    }

    #[test]
    fn duplicate_ids_in_one_frame_emit_once() {
        let mut engine = OccupancyEngine::new(square());
        engine.process_frame(1, &[obs(1, 50.0, 50.0)]);
        let r = engine.process_frame(2, &[obs(1, 5.0, 5.0), obs(1, 50.0, 50.0)]);
        assert_eq!(r.events.len(), 1);
        assert_eq!(r.skipped.len(), 1);
        assert!(engine.tracks().get(1).unwrap().inside);
    }

    #[test]
    fn invalid_observation_keeps_track_alive() {
        let mut engine = OccupancyEngine::new(square());
        engine.process_frame(1, &[obs(1, 5.0, 5.0)]);
        let r = engine.process_frame(2, &[obs(1, f64::NAN, 5.0)]);
        assert!(r.reaped.is_empty());
        assert_eq!(r.skipped.len(), 1);
        assert_eq!(engine.snapshot().current_inside, 1);
    }

    #[test]
    fn empty_frame_reaps_everything() {
        let mut engine = OccupancyEngine::new(square());
        engine.process_frame(1, &[obs(1, 5.0, 5.0), obs(2, 6.0, 6.0), obs(3, 60.0, 6.0)]);
        assert_eq!(engine.snapshot().current_inside, 2);
        let r = engine.process_frame(2, &[]);
        assert_eq!(r.reaped.len(), 3);
        let s = engine.snapshot();
        assert_eq!((s.current_inside, s.total_tracked, s.vanished_inside), (0, 0, 2));
    }

    #[test]
    fn reload_is_a_hard_reset() {
        let mut engine = OccupancyEngine::new(square());
        engine.process_frame(1, &[obs(1, 50.0, 50.0), obs(2, 5.0, 5.0)]);
        engine.process_frame(2, &[obs(1, 5.0, 5.0), obs(2, 5.0, 5.0)]);
        assert_eq!(engine.snapshot().total_entered, 1);

        engine
            .reload([(100.0, 100.0), (200.0, 100.0), (200.0, 200.0), (100.0, 200.0)])
            .unwrap();
        let s = engine.snapshot();
        assert_eq!(s, Snapshot::default());
        assert!(engine.tracks().is_empty());
        assert_eq!(engine.pending_event_count(), 1);

        // Track 1 is new again under the new region.
        let r = engine.process_frame(3, &[obs(1, 150.0, 150.0)]);
        assert!(r.events.is_empty());
        assert_eq!(engine.snapshot().baseline_inside, 1);
    }

    #[test]
    fn invalid_reload_keeps_state() {
        let mut engine = OccupancyEngine::new(square());
        engine.process_frame(1, &[obs(1, 5.0, 5.0)]);
        let err = engine.reload([(0.0, 0.0), (1.0, 1.0)]).unwrap_err();
        assert_eq!(err, RegionError::TooFewVertices(2));
        assert_eq!(engine.snapshot().current_inside, 1);
        assert_eq!(engine.region(), &square());
    }
}
