//! Pipeline supervisor tying together the frame source, the occupancy engine,
//! the store writer and the status server.
//!
//! Batches are processed strictly in arrival order on the calling thread. After
//! each frame the engine's snapshot is published under a lock for the status
//! server, drained events are queued for the store, and a summary snapshot is
//! queued whenever the cadence is due.

use std::{
    sync::{
        Arc, Mutex, Once,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, warn};
use track_ingest::{
    Acquire, FrameSource, ObservationBatch, ReplaySource, SourceEvent, TrackerSource,
};
use zone_core::{OccupancyEngine, Region, Snapshot};
use zone_store::{EventSink, PolygonStore, RegionRecord, SnapshotStore, SqliteStore, SummaryBucket};

use crate::counting::{
    config::{CountingConfig, SourceConfig},
    data::{
        RegionInfo, SharedStatus, SourceStatus, StatusSnapshot, new_recent_events,
        remember_events, RecentEvents,
    },
    emitter::{StoreEmitter, StoreJob},
    server::spawn_status_server,
    telemetry,
};

/// Batches buffered between a reader thread and the frame loop.
const SOURCE_QUEUE: usize = 2;

/// Run the counting pipeline until the source ends or Ctrl+C is pressed.
pub fn run(config: CountingConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    run_with_shutdown(config, shutdown)
}

fn run_with_shutdown(config: CountingConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    if let Err(err) = telemetry::init_metrics_recorder() {
        warn!("Prometheus recorder unavailable: {err}");
    }

    let pipeline_span = tracing::info_span!(
        "counting.pipeline",
        source = %config.source_label(),
        db = %config.db_path.display(),
        region = tracing::field::Empty,
    );
    let _pipeline_span_guard = pipeline_span.enter();

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("Failed to open store at {}", config.db_path.display()))?;
    let (record, region) = load_region(&store, config.region_id)?;
    pipeline_span.record("region", record.id);
    info!(
        region_id = record.id,
        name = %record.name,
        vertices = region.vertices().len(),
        area = region.area(),
        "counting region loaded"
    );

    // Region polling reads through its own connection, never the writer's lock.
    let region_reader = SqliteStore::open(&config.db_path)
        .with_context(|| format!("Failed to open store at {}", config.db_path.display()))?;

    let shared_store = Arc::new(store.clone());
    let event_sink = config
        .record_events
        .then(|| shared_store.clone() as Arc<dyn EventSink>);
    let emitter = StoreEmitter::spawn(
        shared_store.clone(),
        event_sink,
        config.store_queue,
        config.store_timeout,
    )?;

    let status: SharedStatus = Arc::new(Mutex::new(None));
    let recent = new_recent_events();
    let server = match config.status_addr {
        Some(addr) => {
            let server = spawn_status_server(
                addr,
                status.clone(),
                recent.clone(),
                shared_store.clone() as Arc<dyn SnapshotStore>,
            )?;
            info!("Status available at http://{addr}/status");
            Some(server)
        }
        None => None,
    };

    let mut counting = CountingRun {
        config: &config,
        regions: &region_reader,
        engine: OccupancyEngine::new(region),
        region: record,
        emitter: &emitter,
        status,
        recent,
        received: 0,
        last_frame: None,
        reported_reconnects: 0,
    };

    let result = match &config.source {
        SourceConfig::Tracker(command) => {
            let mut source = FrameSource::new(
                TrackerSource::new(command.clone(), SOURCE_QUEUE),
                config.backoff,
                shutdown.clone(),
            );
            if let Some(timeout) = config.stall_timeout {
                source = source.with_stall_timeout(timeout);
            }
            counting.drive(&mut source)
        }
        SourceConfig::Replay { path, pace } => {
            let mut source = FrameSource::new(
                ReplaySource::new(path.clone(), *pace, SOURCE_QUEUE),
                config.backoff,
                shutdown.clone(),
            );
            counting.drive(&mut source)
        }
    };

    let final_snapshot = counting.finish();
    info!(
        total_entered = final_snapshot.total_entered,
        total_exited = final_snapshot.total_exited,
        current_inside = final_snapshot.current_inside,
        frames = final_snapshot.frames_processed,
        store_failures = emitter.failures(),
        "Stopping counting pipeline"
    );

    emitter.stop();
    if let Some(server) = server {
        server.stop();
    }
    result
}

fn load_region(store: &SqliteStore, region_id: Option<i64>) -> Result<(RegionRecord, Region)> {
    let record = match region_id {
        Some(id) => store
            .get_region(id)
            .with_context(|| format!("Failed to load region {id}"))?,
        None => store.active_region()?.ok_or_else(|| {
            anyhow!(
                "No active region. Create one with `zone-counter zones create --activate` \
                 or pass --region-id."
            )
        })?,
    };
    let region = record
        .to_region()
        .with_context(|| format!("Region {} ({}) is not a valid polygon", record.id, record.name))?;
    Ok((record, region))
}

/// State of one counting run, owned by the frame loop.
struct CountingRun<'a> {
    config: &'a CountingConfig,
    /// Connection used only for region polling.
    regions: &'a SqliteStore,
    engine: OccupancyEngine,
    region: RegionRecord,
    emitter: &'a StoreEmitter,
    status: SharedStatus,
    recent: RecentEvents,
    /// Batches pulled from the source, skipped ones included.
    received: u64,
    last_frame: Option<u64>,
    reported_reconnects: u64,
}

impl CountingRun<'_> {
    fn drive<A: Acquire>(&mut self, source: &mut FrameSource<A>) -> Result<()> {
        loop {
            match source.next() {
                SourceEvent::Batch(batch) => {
                    self.received += 1;
                    if self.received % self.config.frame_skip != 0 {
                        continue;
                    }
                    self.process_batch(batch);
                }
                SourceEvent::Unavailable {
                    attempt, retry_in, ..
                } => {
                    metrics::counter!("zone_source_unavailable_total").increment(1);
                    debug!(attempt, retry_ms = retry_in.as_millis() as u64, "waiting for source");
                }
                SourceEvent::EndOfStream => {
                    info!(source = %source.label(), "source exhausted");
                    self.publish_status(source);
                    return Ok(());
                }
                SourceEvent::Stopped => {
                    info!("stop requested");
                    self.publish_status(source);
                    return Ok(());
                }
            }

            let reconnects = source.reconnects();
            if reconnects > self.reported_reconnects {
                metrics::counter!("zone_source_reconnects_total")
                    .increment(reconnects - self.reported_reconnects);
                self.reported_reconnects = reconnects;
            }
            self.publish_status(source);
        }
    }

    fn process_batch(&mut self, batch: ObservationBatch) {
        let started = Instant::now();
        let frame_number = self.received;
        let observations = batch.observations(self.config.min_confidence);
        let filtered = batch.detections.len() - observations.len();

        let frame_span = tracing::info_span!(
            "frame",
            frame = frame_number,
            tracker_frame = batch.frame,
            detections = observations.len()
        );
        let report = frame_span.in_scope(|| self.engine.process_frame(frame_number, &observations));
        self.last_frame = Some(frame_number);

        let snapshot = self.engine.snapshot();
        metrics::counter!("zone_frames_processed_total").increment(1);
        metrics::counter!("zone_entered_total").increment(report.entered() as u64);
        metrics::counter!("zone_exited_total").increment(report.exited() as u64);
        metrics::counter!("zone_observations_skipped_total").increment(report.skipped.len() as u64);
        metrics::counter!("zone_observations_filtered_total").increment(filtered as u64);
        metrics::counter!("zone_tracks_reaped_total").increment(report.reaped.len() as u64);
        metrics::gauge!("zone_current_inside").set(snapshot.current_inside as f64);
        metrics::gauge!("zone_tracked").set(snapshot.total_tracked as f64);

        if self.config.verbose {
            debug!(
                frame = frame_number,
                observations = observations.len(),
                events = report.events.len(),
                reaped = report.reaped.len(),
                current_inside = snapshot.current_inside,
                "frame processed"
            );
        }

        self.flush_events();
        if self.config.snapshot_cadence.is_due(snapshot.frames_processed) {
            self.push_snapshot(snapshot);
        }
        if self.config.region_poll_frames > 0
            && snapshot.frames_processed % self.config.region_poll_frames == 0
        {
            self.poll_region();
        }

        metrics::histogram!("zone_frame_latency_seconds").record(started.elapsed().as_secs_f64());
    }

    /// Hand every pending event to the recent buffer and the store.
    fn flush_events(&mut self) {
        let events = self.engine.get_pending_events();
        if events.is_empty() {
            return;
        }
        remember_events(&self.recent, &events);
        if self.config.record_events {
            self.emitter.submit(StoreJob::Events {
                region_id: self.region.id,
                events,
            });
        }
    }

    fn push_snapshot(&self, snapshot: Snapshot) {
        self.emitter.submit(StoreJob::Snapshot {
            region_id: self.region.id,
            bucket: SummaryBucket::now(),
            snapshot,
        });
    }

    /// Reload the engine when the stored region changed since it was loaded.
    fn poll_region(&mut self) {
        let latest = match self.config.region_id {
            Some(id) => self.regions.get_region(id).map(Some),
            None => self.regions.active_region(),
        };
        let record = match latest {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(region_id = self.region.id, "no active region; keeping current");
                return;
            }
            Err(err) => {
                warn!("region poll failed: {err}");
                return;
            }
        };
        if record.id == self.region.id
            && record.updated_at == self.region.updated_at
            && record.points == self.region.points
        {
            return;
        }

        let region = match record.to_region() {
            Ok(region) => region,
            Err(err) => {
                warn!(region_id = record.id, "ignoring invalid region update: {err}");
                return;
            }
        };

        // Everything counted so far belongs to the old region.
        self.flush_events();
        self.push_snapshot(self.engine.snapshot());
        let previous = self.region.id;
        self.engine.replace_region(region);
        info!(
            previous_region = previous,
            region_id = record.id,
            name = %record.name,
            "region changed; counters reset"
        );
        metrics::counter!("zone_region_reloads_total").increment(1);
        self.region = record;
    }

    fn publish_status<A: Acquire>(&self, source: &FrameSource<A>) {
        let status = StatusSnapshot {
            region: RegionInfo::new(self.region.id, self.region.name.clone(), self.engine.region()),
            counts: self.engine.snapshot(),
            source: SourceStatus {
                label: source.label(),
                state: source.state(),
                reconnects: source.reconnects(),
                consecutive_failures: source.consecutive_failures(),
            },
            last_frame: self.last_frame,
            pending_events: self.engine.pending_event_count(),
            dropped_events: self.engine.dropped_event_count(),
            store_failures: self.emitter.failures(),
            updated_at: Utc::now(),
        };
        if let Ok(mut guard) = self.status.lock() {
            *guard = Some(status);
        }
    }

    /// Flush outstanding events and queue a closing snapshot.
    fn finish(&mut self) -> Snapshot {
        self.flush_events();
        let snapshot = self.engine.snapshot();
        if snapshot.frames_processed > 0 {
            self.push_snapshot(snapshot);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use track_ingest::BackoffPolicy;
    use zone_core::{Point, SnapshotCadence};
    use zone_store::NewRegion;

    use super::*;
    use crate::counting::config::TelemetryOptions;

    fn config(db: &std::path::Path, replay: &std::path::Path) -> CountingConfig {
        CountingConfig {
            source: SourceConfig::Replay {
                path: replay.to_path_buf(),
                pace: Duration::ZERO,
            },
            db_path: db.to_path_buf(),
            region_id: None,
            snapshot_cadence: SnapshotCadence::every(2),
            frame_skip: 1,
            min_confidence: 0.0,
            backoff: BackoffPolicy {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(1),
            },
            stall_timeout: None,
            store_timeout: Duration::from_secs(1),
            store_queue: 16,
            status_addr: None,
            region_poll_frames: 0,
            record_events: true,
            verbose: true,
            telemetry: TelemetryOptions::default(),
        }
    }

    fn seed_region(db: &std::path::Path) -> i64 {
        let store = SqliteStore::open(db).unwrap();
        let id = store
            .create_region(&NewRegion {
                name: "square".to_string(),
                description: String::new(),
                points: square(0.0, 10.0),
            })
            .unwrap();
        store.activate_region(id).unwrap();
        id
    }

    #[test]
    fn replay_counts_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("zones.db");
        let replay = dir.path().join("frames.jsonl");
        let region_id = seed_region(&db);

        // Bboxes centred on (20,20), (5,5) and back: one entry, one exit.
        let mut file = std::fs::File::create(&replay).unwrap();
        for bbox in [
            "[18, 18, 22, 22]",
            "[3, 3, 7, 7]",
            "[3, 3, 7, 7]",
            "[18, 18, 22, 22]",
        ] {
            writeln!(
                file,
                r#"{{"detections": [{{"track_id": 1, "bbox": {bbox}, "confidence": 0.9}}]}}"#
            )
            .unwrap();
        }
        drop(file);

        run_with_shutdown(config(&db, &replay), Arc::new(AtomicBool::new(false))).unwrap();

        let store = SqliteStore::open(&db).unwrap();
        assert_eq!(store.count_events(region_id).unwrap(), 2);
        let rows = store
            .summaries_since(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            (rows[0].total_entered, rows[0].total_exited, rows[0].current_count),
            (1, 1, 0)
        );
    }

    fn square(origin: f64, size: f64) -> Vec<Point> {
        vec![
            Point::new(origin, origin),
            Point::new(origin + size, origin),
            Point::new(origin + size, origin + size),
            Point::new(origin, origin + size),
        ]
    }

    fn batch_at(x: f64, y: f64) -> ObservationBatch {
        ObservationBatch {
            detections: vec![track_ingest::Detection {
                track_id: 1,
                bbox: [x - 1.0, y - 1.0, x + 1.0, y + 1.0],
                confidence: 0.9,
                class_id: None,
            }],
            ..ObservationBatch::default()
        }
    }

    #[test]
    fn region_change_flushes_old_region_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("zones.db");
        let replay = dir.path().join("unused.jsonl");
        let first = seed_region(&db);

        let mut config = config(&db, &replay);
        config.region_poll_frames = 1;
        let store = SqliteStore::open(&db).unwrap();
        let regions = SqliteStore::open(&db).unwrap();
        let writer = Arc::new(SqliteStore::open(&db).unwrap());
        let emitter = StoreEmitter::spawn(
            writer.clone(),
            Some(writer.clone() as Arc<dyn EventSink>),
            16,
            Duration::from_secs(1),
        )
        .unwrap();

        let (record, region) = load_region(&store, None).unwrap();
        let mut run = CountingRun {
            config: &config,
            regions: &regions,
            engine: OccupancyEngine::new(region),
            region: record,
            emitter: &emitter,
            status: Arc::new(Mutex::new(None)),
            recent: new_recent_events(),
            received: 0,
            last_frame: None,
            reported_reconnects: 0,
        };

        run.process_batch(batch_at(20.0, 20.0));
        run.process_batch(batch_at(5.0, 5.0));
        assert_eq!(run.engine.snapshot().total_entered, 1);

        // A two-point polygon written behind the store's back is ignored.
        let raw = rusqlite::Connection::open(&db).unwrap();
        raw.execute(
            "UPDATE polygon_areas SET coordinates = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![
                r#"{"points":[{"x":0.0,"y":0.0},{"x":1.0,"y":1.0}]}"#,
                Utc::now(),
                first
            ],
        )
        .unwrap();
        run.process_batch(batch_at(5.0, 5.0));
        assert_eq!(run.region.id, first);
        assert_eq!(run.engine.region().vertices().len(), 4);
        assert_eq!(run.engine.snapshot().total_entered, 1);
        assert_eq!(run.engine.snapshot().frames_processed, 3);

        // No active region at all: keep counting on the current one.
        store.delete_region(first, false).unwrap();
        run.process_batch(batch_at(5.0, 5.0));
        assert_eq!(run.region.id, first);
        assert_eq!(run.engine.snapshot().current_inside, 1);

        let second = store
            .create_region(&NewRegion {
                name: "far".to_string(),
                description: String::new(),
                points: square(100.0, 10.0),
            })
            .unwrap();
        store.activate_region(second).unwrap();
        run.process_batch(batch_at(5.0, 5.0));

        assert_eq!(run.region.id, second);
        assert_eq!(run.engine.region().bounds().min, Point::new(100.0, 100.0));
        let counts = run.engine.snapshot();
        assert_eq!(
            (counts.total_entered, counts.current_inside, counts.frames_processed),
            (0, 0, 0)
        );
        assert_eq!(run.engine.tracks().len(), 0);

        drop(run);
        emitter.stop();
        assert_eq!(store.count_events(first).unwrap(), 1);
        let rows: Vec<_> = store
            .summaries_since(Utc::now() - chrono::Duration::hours(1))
            .unwrap()
            .into_iter()
            .filter(|row| row.region_id == first)
            .collect();
        assert!(!rows.is_empty());
        assert!(
            rows.iter()
                .all(|row| (row.total_entered, row.current_count) == (1, 1))
        );
    }

    #[test]
    fn missing_active_region_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("empty.db");
        let replay = dir.path().join("frames.jsonl");
        std::fs::write(&replay, "{}\n").unwrap();

        let err = run_with_shutdown(config(&db, &replay), Arc::new(AtomicBool::new(false)))
            .unwrap_err();
        assert!(err.to_string().contains("No active region"));
    }

    #[test]
    fn raised_stop_flag_ends_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("zones.db");
        let replay = dir.path().join("frames.jsonl");
        seed_region(&db);
        std::fs::write(&replay, "{}\n{}\n").unwrap();

        run_with_shutdown(config(&db, &replay), Arc::new(AtomicBool::new(true))).unwrap();
        let store = SqliteStore::open(&db).unwrap();
        assert!(
            store
                .summaries_since(Utc::now() - chrono::Duration::hours(1))
                .unwrap()
                .is_empty()
        );
    }
}
