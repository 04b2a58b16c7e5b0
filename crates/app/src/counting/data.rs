use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use track_ingest::SourceState;
use zone_core::{Bounds, CrossingEvent, Point, Region, Snapshot};

pub(crate) const RECENT_EVENTS_CAPACITY: usize = 64;

#[derive(Clone, Debug, Serialize)]
pub(crate) struct RegionInfo {
    pub(crate) id: i64,
    pub(crate) name: String,
    pub(crate) vertices: Vec<Point>,
    pub(crate) bounds: Bounds,
    pub(crate) centroid: Point,
    pub(crate) area: f64,
}

impl RegionInfo {
    pub(crate) fn new(id: i64, name: impl Into<String>, region: &Region) -> Self {
        Self {
            id,
            name: name.into(),
            vertices: region.vertices().to_vec(),
            bounds: region.bounds(),
            centroid: region.centroid(),
            area: region.area(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct SourceStatus {
    pub(crate) label: String,
    pub(crate) state: SourceState,
    pub(crate) reconnects: u64,
    pub(crate) consecutive_failures: u32,
}

/// Whole-frame view served by `/status`.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct StatusSnapshot {
    pub(crate) region: RegionInfo,
    pub(crate) counts: Snapshot,
    pub(crate) source: SourceStatus,
    pub(crate) last_frame: Option<u64>,
    pub(crate) pending_events: usize,
    pub(crate) dropped_events: u64,
    pub(crate) store_failures: u64,
    pub(crate) updated_at: DateTime<Utc>,
}

pub(crate) type SharedStatus = Arc<Mutex<Option<StatusSnapshot>>>;
pub(crate) type RecentEvents = Arc<Mutex<VecDeque<CrossingEvent>>>;

pub(crate) fn new_recent_events() -> RecentEvents {
    Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_EVENTS_CAPACITY)))
}

/// Append `events`, keeping only the newest [`RECENT_EVENTS_CAPACITY`].
pub(crate) fn remember_events(recent: &RecentEvents, events: &[CrossingEvent]) {
    if events.is_empty() {
        return;
    }
    if let Ok(mut buffer) = recent.lock() {
        for event in events {
            if buffer.len() == RECENT_EVENTS_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }
    }
}
