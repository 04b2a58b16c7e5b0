use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use zone_core::{Point, Region, RegionError};

/// Stored polygon coordinates, `{"points": [{"x": .., "y": ..}, ..]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub points: Vec<Point>,
}

/// A named region as persisted in the polygon store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub points: Vec<Point>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegionRecord {
    pub fn to_region(&self) -> Result<Region, RegionError> {
        Region::new(self.points.iter().copied())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRegion {
    pub name: String,
    pub description: String,
    pub points: Vec<Point>,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub points: Option<Vec<Point>>,
}

impl RegionUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.points.is_none()
    }
}

/// Region export/import document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDocument {
    #[serde(default = "default_import_name")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub coordinates: Coordinates,
}

fn default_import_name() -> String {
    "Imported Polygon".to_string()
}

impl From<RegionDocument> for NewRegion {
    fn from(doc: RegionDocument) -> Self {
        Self {
            name: doc.name,
            description: doc.description,
            points: doc.coordinates.points,
        }
    }
}

/// Hourly bucket a snapshot is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SummaryBucket {
    pub date: NaiveDate,
    pub hour: u32,
}

impl SummaryBucket {
    pub fn of<Tz: TimeZone>(at: &DateTime<Tz>) -> Self {
        Self {
            date: at.date_naive(),
            hour: at.hour(),
        }
    }

    /// Bucket for the current local hour.
    pub fn now() -> Self {
        Self::of(&chrono::Local::now())
    }

    pub fn label(&self) -> String {
        format!(
            "{:04}-{:02}-{:02} {:02}:00",
            self.date.year(),
            self.date.month(),
            self.date.day(),
            self.hour
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub region_id: i64,
    pub bucket: SummaryBucket,
    pub total_entered: u64,
    pub total_exited: u64,
    pub current_count: u64,
    pub updated_at: DateTime<Utc>,
}
