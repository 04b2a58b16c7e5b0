//! Store writer stage.
//!
//! Snapshot upserts and event batches are handed to a dedicated thread over a
//! bounded channel. A push that cannot be queued within the configured timeout
//! is dropped and counted as a failure, as is any store error on the worker.
//! Neither ever reaches the frame loop.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, SendTimeoutError, bounded};
use tracing::{debug, warn};
use zone_core::{CrossingEvent, Snapshot};
use zone_store::{EventSink, SnapshotStore, SummaryBucket};

use crate::counting::telemetry;

pub(crate) enum StoreJob {
    Snapshot {
        region_id: i64,
        bucket: SummaryBucket,
        snapshot: Snapshot,
    },
    Events {
        region_id: i64,
        events: Vec<CrossingEvent>,
    },
}

impl StoreJob {
    fn label(&self) -> &'static str {
        match self {
            StoreJob::Snapshot { .. } => "snapshot",
            StoreJob::Events { .. } => "events",
        }
    }
}

/// Handle to the writer thread.
pub(crate) struct StoreEmitter {
    tx: Option<Sender<StoreJob>>,
    timeout: Duration,
    failures: Arc<AtomicU64>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StoreEmitter {
    pub(crate) fn spawn(
        snapshots: Arc<dyn SnapshotStore>,
        events: Option<Arc<dyn EventSink>>,
        queue: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<StoreJob>(queue.max(1));
        let failures = Arc::new(AtomicU64::new(0));
        let worker_failures = failures.clone();

        let handle = telemetry::spawn_thread("store-writer", move || {
            let _worker_guard = tracing::info_span!("store.worker").entered();
            for job in rx {
                let label = job.label();
                let started = Instant::now();
                let result = match job {
                    StoreJob::Snapshot {
                        region_id,
                        bucket,
                        snapshot,
                    } => snapshots
                        .upsert_snapshot(region_id, bucket, &snapshot)
                        .map(|()| {
                            debug!(
                                region_id,
                                bucket = %bucket.label(),
                                total_entered = snapshot.total_entered,
                                total_exited = snapshot.total_exited,
                                current_inside = snapshot.current_inside,
                                "snapshot stored"
                            );
                        }),
                    StoreJob::Events { region_id, events: batch } => match events.as_ref() {
                        Some(sink) => sink.record_events(region_id, &batch),
                        None => Ok(()),
                    },
                };
                metrics::histogram!("zone_store_write_seconds", "kind" => label)
                    .record(started.elapsed().as_secs_f64());
                if let Err(err) = result {
                    worker_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("zone_store_push_failures_total", "kind" => label)
                        .increment(1);
                    warn!("store {label} write failed: {err}");
                }
            }
        })
        .context("Failed to spawn store writer thread")?;

        Ok(Self {
            tx: Some(tx),
            timeout,
            failures,
            handle: Some(handle),
        })
    }

    /// Queue `job`. Returns `false` when it was dropped.
    pub(crate) fn submit(&self, job: StoreJob) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        let label = job.label();
        match tx.send_timeout(job, self.timeout) {
            Ok(()) => {
                metrics::gauge!("zone_store_queue_depth").set(tx.len() as f64);
                true
            }
            Err(err) => {
                let reason = match err {
                    SendTimeoutError::Timeout(_) => "queue full",
                    SendTimeoutError::Disconnected(_) => "writer stopped",
                };
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("zone_store_push_failures_total", "kind" => label)
                    .increment(1);
                warn!("dropping store {label} push: {reason}");
                false
            }
        }
    }

    /// Pushes dropped or failed so far.
    pub(crate) fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Drain queued jobs and wait for the writer to exit.
    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StoreEmitter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
