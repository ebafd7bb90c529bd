//! `firewatch-scheduler`: interval-driven routines with a start/stop/execute
//! lifecycle.
//!
//! # Overview
//!
//! Each routine is owned by a single Tokio task (the [`engine::RoutineEngine`])
//! that holds the runtime state and the interval timer. Callers talk to it
//! through a cloneable [`handle::RoutineHandle`], which sends commands over an
//! mpsc channel and awaits a oneshot reply, so no lock guards the state.
//!
//! ```text
//!   Stopped ──start()──▶ Running ──stop() / task failure──▶ Stopped
//! ```
//!
//! A failed execution is fatal to the schedule: the routine stops itself,
//! records the failure as its stop reason, and the timer is dropped.
//! Executions themselves run on spawned tasks, so a slow body never blocks
//! `status()` or `stop()`, and a timer tick may overlap a manual execution.

pub mod engine;
pub mod error;
pub mod handle;
pub mod log;
pub mod task;
pub mod types;

pub use engine::RoutineEngine;
pub use error::{Result, RoutineError};
pub use handle::{RoutineControl, RoutineHandle};
pub use log::{LogEntry, LogLevel, RoutineLog};
pub use task::{NoHooks, RoutineHooks, RoutineTask, TaskFailure};
pub use types::{RoutineDescriptor, RoutineStatus, StopReason, EXECUTION_HISTORY};
