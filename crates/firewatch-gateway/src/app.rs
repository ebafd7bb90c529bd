use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use firewatch_core::FirewatchConfig;

use crate::http::{health, routines};
use crate::registry::RoutineRegistry;

/// Central shared state: passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: Arc<FirewatchConfig>,
    pub routines: RoutineRegistry,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Arc<FirewatchConfig>, routines: RoutineRegistry) -> Self {
        Self {
            config,
            routines,
            started_at: Utc::now(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/routines", get(routines::list))
        .route("/routines/{name}/start", post(routines::start))
        .route("/routines/{name}/stop", post(routines::stop))
        .route("/routines/{name}/execute", post(routines::execute))
        .route("/routines/{name}/status", get(routines::status))
        .route("/routines/{name}/stats", get(routines::stats))
        .route("/routines/{name}/reset-stats", post(routines::reset_stats))
        .route("/routines/{name}/logs", get(routines::logs))
        .route("/routines/{name}/resync", post(routines::resync))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
