//! SQLite backend implementing every store trait.

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;
use zone_core::{CrossingEvent, Region, Snapshot};

use crate::{
    EventSink, PolygonStore, SnapshotStore,
    error::{Result, StoreError},
    types::{Coordinates, NewRegion, RegionRecord, RegionUpdate, SummaryBucket, SummaryRow},
};

/// Cloneable handle to one SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS polygon_areas (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                coordinates TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS counting_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                polygon_area_id INTEGER NOT NULL,
                tracking_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                frame_number INTEGER NOT NULL,
                position_x REAL NOT NULL,
                position_y REAL NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS counting_summary (
                polygon_area_id INTEGER NOT NULL,
                summary_date TEXT NOT NULL,
                summary_hour INTEGER NOT NULL,
                total_entered INTEGER NOT NULL,
                total_exited INTEGER NOT NULL,
                current_count INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (polygon_area_id, summary_date, summary_hour)
            );

            CREATE INDEX IF NOT EXISTS idx_events_area_time
                ON counting_events(polygon_area_id, recorded_at);
            CREATE INDEX IF NOT EXISTS idx_summary_updated
                ON counting_summary(updated_at);",
        )?;
        Ok(())
    }
}

const REGION_COLUMNS: &str =
    "id, name, description, coordinates, is_active, created_at, updated_at";

fn region_from_row(row: &Row<'_>) -> rusqlite::Result<(RegionRecord, String)> {
    let coordinates: String = row.get(3)?;
    Ok((
        RegionRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            points: Vec::new(),
            is_active: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        },
        coordinates,
    ))
}

fn with_points((mut record, coordinates): (RegionRecord, String)) -> Result<RegionRecord> {
    let parsed: Coordinates = serde_json::from_str(&coordinates)?;
    record.points = parsed.points;
    Ok(record)
}

fn encode_points(points: &[zone_core::Point]) -> Result<String> {
    // Reject anything the engine would refuse to load.
    Region::new(points.iter().copied())?;
    Ok(serde_json::to_string(&Coordinates {
        points: points.to_vec(),
    })?)
}

impl PolygonStore for SqliteStore {
    fn create_region(&self, region: &NewRegion) -> Result<i64> {
        let coordinates = encode_points(&region.points)?;
        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO polygon_areas (name, description, coordinates, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
            params![region.name, region.description, coordinates, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(region_id = id, name = %region.name, "region created");
        Ok(id)
    }

    fn list_regions(&self, active_only: bool) -> Result<Vec<RegionRecord>> {
        let conn = self.lock()?;
        let sql = if active_only {
            format!(
                "SELECT {REGION_COLUMNS} FROM polygon_areas WHERE is_active = 1 ORDER BY created_at DESC, id DESC"
            )
        } else {
            format!("SELECT {REGION_COLUMNS} FROM polygon_areas ORDER BY created_at DESC, id DESC")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], region_from_row)?;
        rows.map(|row| with_points(row?)).collect()
    }

    fn get_region(&self, id: i64) -> Result<RegionRecord> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {REGION_COLUMNS} FROM polygon_areas WHERE id = ?1"),
                params![id],
                region_from_row,
            )
            .optional()?;
        row.map(with_points)
            .unwrap_or_else(|| Err(StoreError::NotFound(id)))
    }

    fn active_region(&self) -> Result<Option<RegionRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {REGION_COLUMNS} FROM polygon_areas WHERE is_active = 1
                     ORDER BY updated_at DESC, id DESC LIMIT 1"
                ),
                [],
                region_from_row,
            )
            .optional()?;
        row.map(with_points).transpose()
    }

    fn update_region(&self, id: i64, update: &RegionUpdate) -> Result<()> {
        if update.is_empty() {
            return Err(StoreError::EmptyUpdate);
        }
        let coordinates = update
            .points
            .as_deref()
            .map(encode_points)
            .transpose()?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now();
        let changed = tx.execute(
            "UPDATE polygon_areas SET updated_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        if let Some(name) = &update.name {
            tx.execute(
                "UPDATE polygon_areas SET name = ?2 WHERE id = ?1",
                params![id, name],
            )?;
        }
        if let Some(description) = &update.description {
            tx.execute(
                "UPDATE polygon_areas SET description = ?2 WHERE id = ?1",
                params![id, description],
            )?;
        }
        if let Some(coordinates) = coordinates {
            tx.execute(
                "UPDATE polygon_areas SET coordinates = ?2 WHERE id = ?1",
                params![id, coordinates],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_region(&self, id: i64, hard: bool) -> Result<()> {
        let conn = self.lock()?;
        let changed = if hard {
            conn.execute("DELETE FROM polygon_areas WHERE id = ?1", params![id])?
        } else {
            conn.execute(
                "UPDATE polygon_areas SET is_active = 0, updated_at = ?2 WHERE id = ?1",
                params![id, Utc::now()],
            )?
        };
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    fn activate_region(&self, id: i64) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT id FROM polygon_areas WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(id));
        }
        tx.execute("UPDATE polygon_areas SET is_active = 0 WHERE is_active = 1", [])?;
        tx.execute(
            "UPDATE polygon_areas SET is_active = 1, updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now()],
        )?;
        tx.commit()?;
        debug!(region_id = id, "region activated");
        Ok(())
    }
}

impl SnapshotStore for SqliteStore {
    fn upsert_snapshot(
        &self,
        region_id: i64,
        bucket: SummaryBucket,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO counting_summary
                (polygon_area_id, summary_date, summary_hour, total_entered, total_exited, current_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(polygon_area_id, summary_date, summary_hour) DO UPDATE SET
                total_entered = excluded.total_entered,
                total_exited = excluded.total_exited,
                current_count = excluded.current_count,
                updated_at = excluded.updated_at",
            params![
                region_id,
                bucket.date,
                bucket.hour,
                snapshot.total_entered as i64,
                snapshot.total_exited as i64,
                snapshot.current_inside as i64,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    fn summaries_since(&self, since: DateTime<Utc>) -> Result<Vec<SummaryRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT polygon_area_id, summary_date, summary_hour, total_entered, total_exited,
                    current_count, updated_at
             FROM counting_summary
             WHERE updated_at >= ?1
             ORDER BY updated_at",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok(SummaryRow {
                region_id: row.get(0)?,
                bucket: SummaryBucket {
                    date: row.get(1)?,
                    hour: row.get(2)?,
                },
                total_entered: row.get::<_, i64>(3)?.max(0) as u64,
                total_exited: row.get::<_, i64>(4)?.max(0) as u64,
                current_count: row.get::<_, i64>(5)?.max(0) as u64,
                updated_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl EventSink for SqliteStore {
    fn record_events(&self, region_id: i64, events: &[CrossingEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO counting_events
                    (polygon_area_id, tracking_id, event_type, frame_number, position_x, position_y, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for event in events {
                stmt.execute(params![
                    region_id,
                    event.track_id,
                    event.kind.as_str(),
                    event.frame_number as i64,
                    event.position.x,
                    event.position.y,
                    event.timestamp,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn count_events(&self, region_id: i64) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM counting_events WHERE polygon_area_id = ?1",
            params![region_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}
