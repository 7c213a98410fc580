// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Engine-exposed read-only HTTP surface (§6).
//!
//! Everything that mutates engine state (starting/stopping timelines,
//! preview/go-live, watchdog control, schedule CRUD) is a plain Rust method
//! on `TimelineExecutor`/`StreamRouter`/`WatchdogManager`/`Scheduler`, called
//! directly by whatever external router layer owns persistence and auth —
//! that layer is out of scope here (§1). This module only exposes GET
//! endpoints for status:
//!
//!   GET /status                       → engine + router + hardware summary
//!   GET /timelines/{id}/position      → playback position for one timeline
//!   GET /watchdog/status              → every active watchdog's health counters
//!   GET /scheduler/status             → configured schedules + active one

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::router::StreamRouter;
use crate::scheduler::Scheduler;
use crate::timeline::TimelineExecutor;
use crate::watchdog::WatchdogManager;

/// Shared state passed to all handlers.
pub struct AppState {
    pub executor: Arc<TimelineExecutor>,
    pub router: Arc<StreamRouter>,
    pub watchdog: Arc<WatchdogManager>,
    pub scheduler: Arc<Scheduler>,
}

#[derive(Serialize)]
struct StatusResponse {
    platform: String,
    hardware_accelerated: bool,
    max_concurrent_streams: u32,
    active_timeline_ids: Vec<i64>,
    router: crate::router::RouterStatus,
}

#[derive(Serialize)]
struct ScheduleSummary {
    id: i64,
    enabled: bool,
    days_of_week: Vec<u8>,
}

#[derive(Serialize)]
struct SchedulerStatusResponse {
    active_schedule_id: Option<i64>,
    schedules: Vec<ScheduleSummary>,
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/timelines/{id}/position", get(handle_timeline_position))
        .route("/watchdog/status", get(handle_watchdog_status))
        .route("/scheduler/status", get(handle_scheduler_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", port);
    info!(port, "engine status API listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind engine status API");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "engine status API error");
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hardware = state.executor.hardware();
    let resp = StatusResponse {
        platform: hardware.platform_label.clone(),
        hardware_accelerated: hardware.hardware_accelerated,
        max_concurrent_streams: hardware.max_concurrent_streams,
        active_timeline_ids: state.executor.active_timeline_ids(),
        router: state.router.status().await,
    };
    (StatusCode::OK, axum::Json(resp))
}

async fn handle_timeline_position(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.executor.playback_position(id) {
        Some(position) => (StatusCode::OK, axum::Json(position)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({ "error": format!("timeline {id} is not active") })),
        )
            .into_response(),
    }
}

async fn handle_watchdog_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, axum::Json(state.watchdog.all_statuses()))
}

async fn handle_scheduler_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let schedules = state
        .scheduler
        .list_schedules()
        .iter()
        .map(|s| ScheduleSummary { id: s.id, enabled: s.enabled, days_of_week: s.days_of_week.clone() })
        .collect();
    let resp = SchedulerStatusResponse { active_schedule_id: state.scheduler.active_schedule_id(), schedules };
    (StatusCode::OK, axum::Json(resp))
}
