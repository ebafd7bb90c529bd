use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness check.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "routines": state.routines.len(),
        "upstream_configured": state.config.upstream.require_base_url().is_ok(),
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
    }))
}
