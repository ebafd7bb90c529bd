use firewatch_core::ErrorCode;
use thiserror::Error;

/// Errors surfaced by routine lifecycle operations.
#[derive(Debug, Error)]
pub enum RoutineError {
    #[error("Routine {name} is already running")]
    AlreadyRunning { name: String },

    #[error("Routine {name} is not running")]
    NotRunning { name: String },

    /// `should_not_start` vetoed the start; state was left untouched.
    #[error("Routine start refused: {reason}")]
    StartRefused { reason: String },

    /// A lifecycle hook failed. `code` is the hook error's own stable code.
    #[error("{hook} hook failed: {message}")]
    HookFailed {
        hook: &'static str,
        code: &'static str,
        message: String,
    },

    /// The task body failed. A running routine stops itself on this.
    #[error("Execution failed: {message}")]
    ExecutionFailed { code: &'static str, message: String },

    /// The engine task is gone (shut down or panicked).
    #[error("Routine {name} is unavailable")]
    Unavailable { name: String },
}

impl RoutineError {
    /// True for state conflicts the caller caused; these are never retried.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning { .. } | Self::NotRunning { .. } | Self::StartRefused { .. }
        )
    }

    /// Code of the underlying failure, when there is one.
    pub fn cause_code(&self) -> Option<&'static str> {
        match self {
            Self::HookFailed { code, .. } | Self::ExecutionFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl ErrorCode for RoutineError {
    fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning { .. } => "already_running",
            Self::NotRunning { .. } => "not_running",
            Self::StartRefused { .. } => "start_refused",
            Self::HookFailed { code, .. } => *code,
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::Unavailable { .. } => "routine_unavailable",
        }
    }
}

pub type Result<T> = std::result::Result<T, RoutineError>;
