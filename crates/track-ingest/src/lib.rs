//! Observation ingestion for the zone counter.
//!
//! Tracker output arrives as JSON lines, either from a sidecar process or a
//! recorded replay file, and is pulled through a reconnecting [`FrameSource`].

pub mod replay;
pub mod sidecar;
pub mod source;
pub mod types;

pub use replay::{ReplaySource, spawn_replay_reader};
pub use sidecar::{BatchStream, TrackerCommand, TrackerSource, VIDEO_SOURCE_ENV, spawn_tracker_reader};
pub use source::{Acquire, BackoffPolicy, FrameSource, SourceEvent, SourceState};
pub use types::{Detection, IngestError, ObservationBatch, parse_batch_line};
