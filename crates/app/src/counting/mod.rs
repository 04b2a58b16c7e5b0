//! Live counting pipeline: pulls tracked detections from a frame source, runs
//! them through the occupancy engine and publishes counts.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `pipeline`: Drives the source → engine → store loop and region reloads.
//! - `emitter`: Background writer for snapshots and crossing events.
//! - `server`: Actix Web status endpoints.
//! - `telemetry`: Tracing and Prometheus setup.
//! - `data`: Shared structs read by the status server.

/// Re-export run settings so callers can configure runs without reaching into
/// submodules.
pub use config::{CountingConfig, RunCliArgs};
/// Launch the counting pipeline with a ready-made configuration.
pub use pipeline::run;

mod config;
mod data;
mod emitter;
mod pipeline;
mod server;
mod telemetry;
