use firewatch_core::{CoreError, ErrorCode};
use firewatch_fetch::FetchError;
use firewatch_scheduler::RoutineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Upstream fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// A full resync is already running; concurrent requests are refused.
    #[error("A full resync is already in progress")]
    SyncInProgress,

    #[error(transparent)]
    Config(#[from] CoreError),

    #[error("Routine control failed: {0}")]
    Routine(#[from] RoutineError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record not found: {id}")]
    RecordNotFound { id: i64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// True for conflicts that should be reported as HTTP 400.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::SyncInProgress => true,
            Self::Routine(e) => e.is_conflict(),
            _ => false,
        }
    }
}

impl ErrorCode for SyncError {
    fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "database_error",
            Self::Fetch(e) => e.code(),
            Self::SyncInProgress => "sync_in_progress",
            Self::Config(e) => e.code(),
            Self::Routine(e) => e.code(),
            Self::Serialization(_) => "serialization_error",
            Self::RecordNotFound { .. } => "record_not_found",
            Self::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
