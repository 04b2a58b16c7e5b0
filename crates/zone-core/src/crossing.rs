//! Crossing detector: turns one observation into at most one membership
//! transition.
//!
//! Classification only looks at the current position. A track that enters and
//! leaves between two sampled frames never produces a transition.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    counters::AggregateCounters,
    event::CrossingKind,
    region::{Point, Region},
    track_store::{TrackId, TrackStore},
};

/// One tracked object as seen in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub track_id: TrackId,
    pub position: Point,
}

impl Observation {
    pub fn new(track_id: TrackId, position: Point) -> Self {
        Self { track_id, position }
    }

    /// Observation anchored at the centre of an `(x1, y1, x2, y2)` box.
    pub fn from_bbox(track_id: TrackId, bbox: [f64; 4]) -> Self {
        let [x1, y1, x2, y2] = bbox;
        Self {
            track_id,
            position: Point::new((x1 + x2) / 2.0, (y1 + y2) / 2.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObservationError {
    #[error("track {track_id} reported a non-finite position")]
    NonFinitePosition { track_id: TrackId },
    #[error("track {track_id} was already observed in frame {frame_number}")]
    DuplicateInFrame { track_id: TrackId, frame_number: u64 },
}

/// Membership change caused by a single observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First sighting of the id; no event regardless of membership.
    FirstSeen { inside: bool },
    Crossed(CrossingKind),
    Unchanged { inside: bool },
}

impl Transition {
    pub fn crossing(self) -> Option<CrossingKind> {
        match self {
            Transition::Crossed(kind) => Some(kind),
            _ => None,
        }
    }
}

/// Apply `observation` to the store and counters.
///
/// Invalid positions leave all state untouched.
pub(crate) fn apply_observation(
    region: &Region,
    tracks: &mut TrackStore,
    counters: &mut AggregateCounters,
    observation: &Observation,
    frame_number: u64,
) -> Result<Transition, ObservationError> {
    let Observation { track_id, position } = *observation;
    if !position.is_finite() {
        return Err(ObservationError::NonFinitePosition { track_id });
    }

    let is_inside = region.is_inside(position);

    let (_, created) = tracks.get_or_create(track_id, position, is_inside, frame_number);
    if created {
        if is_inside {
            counters.record_baseline();
        }
        return Ok(Transition::FirstSeen { inside: is_inside });
    }

    let previous = tracks
        .update(track_id, position, is_inside, frame_number)
        .map(|record| record.inside)
        .unwrap_or(is_inside);

    let transition = match (previous, is_inside) {
        (false, true) => {
            counters.record_entry();
            Transition::Crossed(CrossingKind::Entered)
        }
        (true, false) => {
            counters.record_exit();
            Transition::Crossed(CrossingKind::Exited)
        }
        (_, inside) => Transition::Unchanged { inside },
    };
    Ok(transition)
}
