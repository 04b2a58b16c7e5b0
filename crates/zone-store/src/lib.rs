//! Persistence collaborators of the zone counter.
//!
//! The engine itself never touches storage. The binary loads its region from a
//! [`PolygonStore`], pushes periodic snapshots to a [`SnapshotStore`] and
//! drained crossing events to an [`EventSink`]. [`SqliteStore`] implements all
//! three.

use chrono::{DateTime, Utc};
use zone_core::{CrossingEvent, Snapshot};

pub mod error;
pub mod sqlite;
pub mod types;

pub use error::{Result, StoreError};
pub use sqlite::SqliteStore;
pub use types::{
    Coordinates, NewRegion, RegionDocument, RegionRecord, RegionUpdate, SummaryBucket, SummaryRow,
};

/// Named regions with at most one active at a time.
pub trait PolygonStore {
    /// Insert an inactive region, returning its id. Points must form a valid
    /// region.
    fn create_region(&self, region: &NewRegion) -> Result<i64>;
    /// Newest first.
    fn list_regions(&self, active_only: bool) -> Result<Vec<RegionRecord>>;
    fn get_region(&self, id: i64) -> Result<RegionRecord>;
    fn active_region(&self) -> Result<Option<RegionRecord>>;
    fn update_region(&self, id: i64, update: &RegionUpdate) -> Result<()>;
    /// Deactivate, or remove the row when `hard` is set.
    fn delete_region(&self, id: i64, hard: bool) -> Result<()>;
    /// Make `id` the only active region.
    fn activate_region(&self, id: i64) -> Result<()>;
}

/// Aggregate totals keyed by region and hourly bucket. Writing the same
/// bucket twice overwrites it.
pub trait SnapshotStore: Send + Sync {
    fn upsert_snapshot(&self, region_id: i64, bucket: SummaryBucket, snapshot: &Snapshot)
    -> Result<()>;
    fn summaries_since(&self, since: DateTime<Utc>) -> Result<Vec<SummaryRow>>;
}

/// Append-only log of crossing events.
pub trait EventSink: Send + Sync {
    fn record_events(&self, region_id: i64, events: &[CrossingEvent]) -> Result<()>;
    fn count_events(&self, region_id: i64) -> Result<u64>;
}
