//! Zone-crossing event engine.
//!
//! Converts a per-frame stream of tracked-object positions into entry/exit
//! events and occupancy totals for one polygonal region.
//!
//! - `region`: polygon validation and the point-in-polygon test.
//! - `track_store`: per-track membership state.
//! - `crossing`: per-observation transition detection.
//! - `reaper`: removal of tracks the tracker stopped reporting.
//! - `counters`: aggregate totals, snapshots and snapshot cadence.
//! - `event`: crossing events and the pending queue.
//! - `engine`: the [`OccupancyEngine`] tying the above together.

pub mod counters;
pub mod crossing;
pub mod engine;
pub mod event;
mod reaper;
pub mod region;
pub mod track_store;

pub use counters::{Snapshot, SnapshotCadence};
pub use crossing::{Observation, ObservationError, Transition};
pub use engine::{FrameReport, OccupancyEngine};
pub use event::{CrossingEvent, CrossingKind};
pub use region::{Bounds, Point, Region, RegionError};
pub use track_store::{TrackId, TrackRecord, TrackStore};
