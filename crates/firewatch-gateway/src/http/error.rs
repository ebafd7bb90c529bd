use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use firewatch_core::ErrorCode;
use firewatch_scheduler::RoutineError;
use firewatch_sync::SyncError;
use serde_json::json;
use tracing::error;

/// Error body for the control surface.
///
/// Conflicts come back as `400 {error, reason}`; everything unexpected as
/// `500 {error, details}`. Only the top-level message is returned; the full
/// chain stays in the routine log.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn not_found(what: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: format!("{what} not found"),
        }
    }

    fn classify(is_conflict: bool, code: &'static str, message: String) -> Self {
        let status = if is_conflict {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            code,
            message,
        }
    }
}

impl From<RoutineError> for ApiError {
    fn from(e: RoutineError) -> Self {
        Self::classify(e.is_conflict(), e.code(), e.to_string())
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        Self::classify(e.is_conflict(), e.code(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = if self.status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(code = self.code, details = %self.message, "control request failed");
            json!({ "error": self.code, "details": self.message })
        } else {
            json!({ "error": self.code, "reason": self.message })
        };
        (self.status, Json(body)).into_response()
    }
}
