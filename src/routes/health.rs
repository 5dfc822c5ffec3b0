use axum::{extract::State, Json};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::sync::Notify;

use crate::error::EngineResult;
use crate::state::AppState;

static START_TIME: OnceLock<Instant> = OnceLock::new();
static SHUTDOWN_NOTIFY: OnceLock<Notify> = OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

pub fn init_shutdown_notify() {
    SHUTDOWN_NOTIFY.get_or_init(Notify::new);
}

/// Resolves when a shutdown has been requested over HTTP.
pub async fn wait_for_shutdown() {
    if let Some(notify) = SHUTDOWN_NOTIFY.get() {
        notify.notified().await;
    } else {
        std::future::pending::<()>().await;
    }
}

pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime = START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0);
    let index_loaded = state
        .engine
        .get_stats()
        .map(|s| s.index_exists)
        .unwrap_or(false);
    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "index_exists": index_loaded,
    }))
}

/// Graceful shutdown over HTTP (the cross-platform path for supervisors that
/// cannot deliver signals).
pub async fn shutdown_handler(State(state): State<AppState>) -> EngineResult<Json<serde_json::Value>> {
    tracing::info!("shutdown requested over HTTP");
    state.engine.shutdown();
    if let Some(notify) = SHUTDOWN_NOTIFY.get() {
        notify.notify_waiters();
    }
    Ok(Json(json!({ "status": "shutting_down" })))
}
