use std::fmt;

use async_trait::async_trait;
use firewatch_core::ErrorCode;
use serde::Serialize;

/// A failure crossing the routine boundary, with its stable code kept.
///
/// Not `std::error::Error`: the blanket `From` below would overlap with
/// `From<T> for T`.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub code: &'static str,
    /// Top-level message, safe to return to API clients.
    pub message: String,
    /// Message plus every `source()`, for internal logs only.
    pub chain: String,
}

impl TaskFailure {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code,
            chain: message.clone(),
            message,
        }
    }
}

impl<E> From<E> for TaskFailure
where
    E: std::error::Error + ErrorCode,
{
    fn from(err: E) -> Self {
        let mut chain = err.to_string();
        let mut source = err.source();
        while let Some(e) = source {
            chain.push_str(": ");
            chain.push_str(&e.to_string());
            source = e.source();
        }
        Self {
            code: err.code(),
            message: err.to_string(),
            chain,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.chain)
    }
}

/// The unit of work a routine runs on every tick.
#[async_trait]
pub trait RoutineTask: Send + Sync + 'static {
    /// Task-specific counters exposed by `GET /stats`.
    type Stats: Serialize + Clone + Send + Sync + 'static;

    async fn execute(&self) -> Result<(), TaskFailure>;

    fn stats(&self) -> Self::Stats;

    fn reset_stats(&self);
}

/// Lifecycle strategy injected into a routine at construction.
///
/// All methods default to no-ops, so implementors override only what they
/// need.
#[async_trait]
pub trait RoutineHooks: Send + Sync {
    /// Return `Some(reason)` to veto a start without touching routine state.
    async fn should_not_start(&self) -> Option<String> {
        None
    }

    /// Runs after the routine is marked running, before the first execution.
    /// An error rolls the start back and no timer is armed.
    async fn on_start(&self) -> Result<(), TaskFailure> {
        Ok(())
    }

    /// Runs on every stop. Errors are logged; the stop always completes.
    async fn on_stop(&self) -> Result<(), TaskFailure> {
        Ok(())
    }
}

/// Hooks that never veto and never fail.
pub struct NoHooks;

impl RoutineHooks for NoHooks {}
