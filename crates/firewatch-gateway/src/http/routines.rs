//! Control surface for hosted routines: `/routines/{name}/...`.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use firewatch_scheduler::{log::LOG_CAPACITY, LogEntry, RoutineStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::app::AppState;
use crate::http::error::ApiError;
use crate::registry::RegisteredRoutine;

const DEFAULT_LOG_LIMIT: usize = 50;

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct StopParams {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogParams {
    pub limit: Option<usize>,
}

fn lookup<'a>(state: &'a AppState, name: &str) -> Result<&'a RegisteredRoutine, ApiError> {
    state
        .routines
        .get(name)
        .ok_or_else(|| ApiError::not_found(&format!("routine {name}")))
}

/// GET /routines: status of every hosted routine.
pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Vec<RoutineStatus>> {
    let mut statuses = Vec::with_capacity(state.routines.len());
    for routine in state.routines.iter() {
        statuses.push(routine.control.status().await?);
    }
    Ok(Json(statuses))
}

/// POST /routines/{name}/start
pub async fn start(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<RoutineStatus> {
    let routine = lookup(&state, &name)?;
    info!(routine = %name, "start requested");
    Ok(Json(routine.control.start().await?))
}

/// POST /routines/{name}/stop?reason=...
pub async fn stop(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<StopParams>,
) -> ApiResult<RoutineStatus> {
    let routine = lookup(&state, &name)?;
    info!(routine = %name, reason = ?params.reason, "stop requested");
    Ok(Json(routine.control.stop(params.reason).await?))
}

/// POST /routines/{name}/execute: run once now.
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<RoutineStatus> {
    let routine = lookup(&state, &name)?;
    Ok(Json(routine.control.execute().await?))
}

/// GET /routines/{name}/status
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<RoutineStatus> {
    let routine = lookup(&state, &name)?;
    Ok(Json(routine.control.status().await?))
}

/// GET /routines/{name}/stats
pub async fn stats(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Value> {
    let routine = lookup(&state, &name)?;
    Ok(Json(routine.control.stats_json()))
}

/// POST /routines/{name}/reset-stats
pub async fn reset_stats(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<RoutineStatus> {
    let routine = lookup(&state, &name)?;
    Ok(Json(routine.control.reset_stats().await?))
}

/// GET /routines/{name}/logs?limit=N
pub async fn logs(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<LogParams>,
) -> ApiResult<Vec<LogEntry>> {
    let routine = lookup(&state, &name)?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, LOG_CAPACITY);
    Ok(Json(routine.control.logs(limit)))
}

/// POST /routines/{name}/resync: destructive full resync.
pub async fn resync(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Value> {
    let routine = lookup(&state, &name)?;
    let trigger = routine
        .resync
        .as_ref()
        .ok_or_else(|| ApiError::not_found(&format!("full resync for routine {name}")))?;

    info!(routine = %name, "full resync requested");
    let report = trigger.resync().await?;
    let status = routine.control.status().await?;
    Ok(Json(json!({
        "total_synced": report.total_synced,
        "cleared_count": report.cleared_count,
        "pages_fetched": report.pages_fetched,
        "failed_pages": report.failed_pages,
        "status": status,
    })))
}
