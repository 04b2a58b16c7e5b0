//! Actix Web status server exposing counts, recent events and metrics.
//!
//! The server runs on a dedicated thread to keep the frame loop free from
//! Actix runtime concerns. Handlers only read the shared status published after
//! each frame and never touch the engine.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use actix_web::{App, HttpResponse, HttpServer, web};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::error;
use zone_core::CrossingEvent;
use zone_store::{SnapshotStore, SummaryRow};

use crate::counting::{
    data::{RecentEvents, SharedStatus},
    telemetry,
};

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) status: SharedStatus,
    pub(crate) recent: RecentEvents,
    pub(crate) history: Arc<dyn SnapshotStore>,
}

#[derive(Default)]
/// Handle for the status server thread.
pub(crate) struct StatusServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl StatusServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

const MAX_HISTORY_MINUTES: i64 = 60 * 24 * 31;

#[derive(Deserialize)]
struct HistoryQuery {
    minutes: Option<i64>,
}

#[derive(Serialize)]
struct RecentEventsResponse<'a> {
    count: usize,
    events: Vec<&'a CrossingEvent>,
}

#[derive(Serialize)]
struct HistoryResponse {
    minutes: i64,
    rows: Vec<SummaryRow>,
}

/// Spawn the status server thread and wait until it is bound to `addr`.
pub(crate) fn spawn_status_server(
    addr: SocketAddr,
    status: SharedStatus,
    recent: RecentEvents,
    history: Arc<dyn SnapshotStore>,
) -> Result<StatusServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::io::Result<()>>(1);

    let handle = telemetry::spawn_thread("status-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let bound = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(ServerState {
                        status: status.clone(),
                        recent: recent.clone(),
                        history: history.clone(),
                    }))
                    .route("/status", web::get().to(status_handler))
                    .route("/events/recent", web::get().to(recent_events_handler))
                    .route("/stats/history", web::get().to(history_handler))
                    .route("/metrics", web::get().to(metrics_handler))
                    .route("/healthz", web::get().to(health_handler))
            })
            .workers(1)
            .bind(addr);

            let server = match bound {
                Ok(server) => {
                    let _ = ready_tx.send(Ok(()));
                    server.run()
                }
                Err(err) => {
                    let message = err.to_string();
                    let _ = ready_tx.send(Err(err));
                    return Err(std::io::Error::other(message));
                }
            };

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn status server thread")?;

    match ready_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Ok(())) => Ok(StatusServer {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }),
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(err).with_context(|| format!("Failed to bind status server to {addr}"))
        }
        Err(_) => Err(anyhow!("Status server did not start within 5s")),
    }
}

/// Return the latest whole-frame status as JSON.
async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    let guard = match state.status.lock() {
        Ok(guard) => guard,
        Err(err) => return HttpResponse::InternalServerError().body(err.to_string()),
    };
    match guard.as_ref() {
        Some(status) => HttpResponse::Ok().json(status),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Return the most recent crossing events, newest first.
async fn recent_events_handler(state: web::Data<ServerState>) -> HttpResponse {
    let buffer = match state.recent.lock() {
        Ok(buffer) => buffer,
        Err(err) => return HttpResponse::InternalServerError().body(err.to_string()),
    };
    let events: Vec<_> = buffer.iter().rev().collect();
    HttpResponse::Ok().json(RecentEventsResponse {
        count: events.len(),
        events,
    })
}

/// Summary rows updated in the last `minutes` (default 60).
async fn history_handler(
    query: web::Query<HistoryQuery>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let minutes = query.minutes.unwrap_or(60);
    if !(1..=MAX_HISTORY_MINUTES).contains(&minutes) {
        return HttpResponse::BadRequest()
            .body(format!("minutes must be between 1 and {MAX_HISTORY_MINUTES}"));
    }
    let store = state.history.clone();
    let since = Utc::now() - chrono::Duration::minutes(minutes);
    match web::block(move || store.summaries_since(since)).await {
        Ok(Ok(rows)) => HttpResponse::Ok().json(HistoryResponse { minutes, rows }),
        Ok(Err(err)) => HttpResponse::InternalServerError().body(err.to_string()),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

/// Prometheus text exposition.
async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

async fn health_handler() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}
