//! Configuration parsing for the counting pipeline.
//!
//! This module owns translation of CLI arguments into a `CountingConfig`
//! which the pipeline uses without re-parsing flags.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Args;
use track_ingest::{BackoffPolicy, TrackerCommand};
use zone_core::SnapshotCadence;

/// Where tracker batches come from.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceConfig {
    /// Long-running tracker sidecar; reconnected on failure.
    Tracker(TrackerCommand),
    /// Recorded JSON lines; the run ends at EOF.
    Replay { path: PathBuf, pace: Duration },
}

#[derive(Clone, Debug)]
/// Canonical configuration for one counting run.
pub struct CountingConfig {
    pub source: SourceConfig,
    /// SQLite database holding regions, summaries and events.
    pub db_path: PathBuf,
    /// Region to count; the active region when unset.
    pub region_id: Option<i64>,
    pub snapshot_cadence: SnapshotCadence,
    /// Process every Nth batch.
    pub frame_skip: u64,
    pub min_confidence: f32,
    pub backoff: BackoffPolicy,
    pub stall_timeout: Option<Duration>,
    /// Longest a store push may wait for queue space.
    pub store_timeout: Duration,
    pub store_queue: usize,
    pub status_addr: Option<SocketAddr>,
    /// Check the polygon store for region changes every N processed frames.
    pub region_poll_frames: u64,
    pub record_events: bool,
    pub verbose: bool,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunCliArgs {
    /// Tracker sidecar command line (run through `sh -c`).
    #[arg(long = "tracker-cmd", env = "ZC_TRACKER_CMD", value_name = "CMD")]
    pub tracker_cmd: Option<String>,
    /// Video source handed to the sidecar as ZC_VIDEO_SOURCE.
    #[arg(long = "video-source", env = "ZC_VIDEO_SOURCE", value_name = "URI")]
    pub video_source: Option<String>,
    /// Replay recorded tracker output instead of running a sidecar.
    #[arg(long = "replay", value_name = "PATH")]
    pub replay: Option<PathBuf>,
    /// Delay between replayed batches.
    #[arg(long = "replay-interval-ms", value_name = "MS", default_value_t = 0)]
    pub replay_interval_ms: u64,
    /// SQLite database path.
    #[arg(long = "db", env = "ZC_DB_PATH", value_name = "PATH", default_value = "zone_counter.db")]
    pub db_path: PathBuf,
    /// Region id to count (defaults to the active region).
    #[arg(long = "region-id", env = "ZC_REGION_ID", value_name = "ID")]
    pub region_id: Option<i64>,
    /// Push a summary snapshot every N processed frames (0 disables).
    #[arg(long = "snapshot-every", value_name = "FRAMES", default_value_t = 100)]
    pub snapshot_every: u64,
    /// Process every Nth batch.
    #[arg(long = "frame-skip", value_name = "N", default_value_t = 1)]
    pub frame_skip: u64,
    /// Drop detections below this confidence before counting.
    #[arg(long = "min-confidence", value_name = "SCORE", default_value_t = 0.0)]
    pub min_confidence: f32,
    /// Initial reconnect delay.
    #[arg(long = "reconnect-delay-ms", value_name = "MS", default_value_t = 2000)]
    pub reconnect_delay_ms: u64,
    /// Upper bound for the exponential reconnect delay.
    #[arg(long = "max-reconnect-delay-ms", value_name = "MS", default_value_t = 30_000)]
    pub max_reconnect_delay_ms: u64,
    /// Reconnect when the tracker is silent this long (0 disables).
    #[arg(long = "stall-timeout-ms", value_name = "MS", default_value_t = 10_000)]
    pub stall_timeout_ms: u64,
    /// Longest a store push waits for queue space before counting as failed.
    #[arg(long = "store-timeout-ms", value_name = "MS", default_value_t = 250)]
    pub store_timeout_ms: u64,
    /// Pending store writes.
    #[arg(long = "store-queue", value_name = "N", default_value_t = 64)]
    pub store_queue: usize,
    /// Status server bind address.
    #[arg(long = "status-addr", env = "ZC_STATUS_ADDR", value_name = "ADDR", default_value = "127.0.0.1:8080")]
    pub status_addr: SocketAddr,
    /// Do not start the status server.
    #[arg(long = "no-status-server", action = clap::ArgAction::SetTrue)]
    pub no_status_server: bool,
    /// Poll the polygon store for region changes every N frames (0 disables).
    #[arg(long = "region-poll-frames", value_name = "FRAMES", default_value_t = 0)]
    pub region_poll_frames: u64,
    /// Do not persist individual crossing events.
    #[arg(long = "no-event-log", action = clap::ArgAction::SetTrue)]
    pub no_event_log: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Log every processed frame.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<RunCliArgs> for CountingConfig {
    type Error = anyhow::Error;

    fn try_from(args: RunCliArgs) -> Result<Self> {
        let source = match (args.tracker_cmd, args.replay) {
            (Some(_), Some(_)) => bail!("--tracker-cmd and --replay are mutually exclusive"),
            (None, None) => bail!("Missing source. Provide --tracker-cmd <cmd> or --replay <path>."),
            (Some(command_line), None) => {
                if command_line.trim().is_empty() {
                    bail!("--tracker-cmd must not be empty");
                }
                SourceConfig::Tracker(TrackerCommand {
                    command_line,
                    video_source: args.video_source,
                })
            }
            (None, Some(path)) => {
                if !path.is_file() {
                    bail!("Replay file {} does not exist", path.display());
                }
                SourceConfig::Replay {
                    path,
                    pace: Duration::from_millis(args.replay_interval_ms),
                }
            }
        };

        if args.frame_skip == 0 {
            bail!("--frame-skip must be at least 1");
        }
        if !(0.0..=1.0).contains(&args.min_confidence) {
            bail!("--min-confidence must be between 0 and 1");
        }
        if args.reconnect_delay_ms == 0 {
            bail!("--reconnect-delay-ms must be positive");
        }
        if args.max_reconnect_delay_ms < args.reconnect_delay_ms {
            bail!("--max-reconnect-delay-ms must not be below --reconnect-delay-ms");
        }
        if args.store_timeout_ms == 0 {
            bail!("--store-timeout-ms must be positive");
        }
        if args.store_queue == 0 {
            bail!("--store-queue must be at least 1");
        }
        if matches!(args.region_id, Some(id) if id <= 0) {
            bail!("--region-id must be a positive integer");
        }

        let stall_timeout =
            (args.stall_timeout_ms > 0).then(|| Duration::from_millis(args.stall_timeout_ms));
        let status_addr = (!args.no_status_server).then_some(args.status_addr);

        Ok(Self {
            source,
            db_path: args.db_path,
            region_id: args.region_id,
            snapshot_cadence: SnapshotCadence::every(args.snapshot_every),
            frame_skip: args.frame_skip,
            min_confidence: args.min_confidence,
            backoff: BackoffPolicy {
                initial: Duration::from_millis(args.reconnect_delay_ms),
                max: Duration::from_millis(args.max_reconnect_delay_ms),
            },
            stall_timeout,
            store_timeout: Duration::from_millis(args.store_timeout_ms),
            store_queue: args.store_queue,
            status_addr,
            region_poll_frames: args.region_poll_frames,
            record_events: !args.no_event_log,
            verbose: args.verbose,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

impl CountingConfig {
    /// Short description of the configured source for logs.
    pub fn source_label(&self) -> String {
        match &self.source {
            SourceConfig::Tracker(command) => command.command_line.clone(),
            SourceConfig::Replay { path, .. } => path.display().to_string(),
        }
    }
}
