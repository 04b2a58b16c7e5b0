//! Crossing events and the pending queue they wait in until drained.

use std::{collections::VecDeque, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{region::Point, track_store::TrackId};

/// Default upper bound on undrained events.
pub const DEFAULT_MAX_PENDING_EVENTS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrossingKind {
    Entered,
    Exited,
}

impl CrossingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CrossingKind::Entered => "ENTERED",
            CrossingKind::Exited => "EXITED",
        }
    }
}

impl fmt::Display for CrossingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A track crossed the region boundary between two consecutive observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossingEvent {
    pub track_id: TrackId,
    pub kind: CrossingKind,
    pub timestamp: DateTime<Utc>,
    pub frame_number: u64,
    pub position: Point,
}

/// FIFO of events not yet handed to a consumer.
///
/// When the bound is reached the oldest event is dropped so that an absent
/// consumer can never grow memory without limit.
#[derive(Debug)]
pub(crate) struct EventQueue {
    events: VecDeque<CrossingEvent>,
    max_pending: usize,
    dropped: u64,
}

impl EventQueue {
    pub(crate) fn new(max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            events: VecDeque::with_capacity(max_pending.min(256)),
            max_pending,
            dropped: 0,
        }
    }

    pub(crate) fn publish(&mut self, event: CrossingEvent) {
        if self.events.len() >= self.max_pending {
            self.events.pop_front();
            self.dropped += 1;
            warn!(
                max_pending = self.max_pending,
                dropped_total = self.dropped,
                "crossing event queue full, dropping oldest"
            );
        }
        self.events.push_back(event);
    }

    pub(crate) fn drain(&mut self) -> Vec<CrossingEvent> {
        self.events.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}
