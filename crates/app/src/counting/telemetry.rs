//! Telemetry helpers for tracing spans and Prometheus metrics.

use std::{io, path::Path, sync::OnceLock, thread, time::Duration};

use anyhow::{Result, anyhow};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::counting::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Guard returned when a telemetry subscriber has been installed for the current thread.
pub(crate) struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
pub(crate) fn init_metrics_recorder() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle);
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|err| anyhow!("metrics recorder already installed: {err}"))?;

    let upkeep_handle = handle.clone();
    let upkeep = spawn_thread("prometheus-upkeep", move || {
        loop {
            thread::sleep(Duration::from_secs(5));
            upkeep_handle.run_upkeep();
        }
    })?;
    let _ = PROM_UPKEEP_THREAD.set(upkeep);

    Ok(PROM_HANDLE.get_or_init(|| handle))
}

/// Access the Prometheus handle when already initialised.
pub(crate) fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Install the tracing subscriber for the counting run on the current thread.
pub(crate) fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_ref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                tracing::warn!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let default_guard = match chrome_layer {
        Some(chrome) => tracing::subscriber::set_default(
            tracing_subscriber::registry()
                .with(chrome.with_filter(filter_fn(|metadata| metadata.is_span())))
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_timer(fmt::time::uptime())
                        .with_filter(env_filter),
                )
                .with(tracing_error::ErrorLayer::default()),
        ),
        None => tracing::subscriber::set_default(
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_timer(fmt::time::uptime())
                        .with_filter(env_filter),
                )
                .with(tracing_error::ErrorLayer::default()),
        ),
    };

    TelemetryGuard {
        _default_guard: default_guard,
        _chrome_guard: chrome_guard,
    }
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> Result<
    (
        tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
        tracing_chrome::FlushGuard,
    ),
    io::Error,
> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}
