//! Per-routine in-memory activity log served by the control surface.
//!
//! Every record is also emitted as a `tracing` event, so the process log and
//! the `/logs` endpoint never disagree.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

/// Records kept per routine before the oldest are evicted.
pub const LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Cloneable handle to one routine's bounded log.
#[derive(Debug, Clone)]
pub struct RoutineLog {
    routine: Arc<str>,
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl RoutineLog {
    pub fn new(routine: &str) -> Self {
        Self {
            routine: Arc::from(routine),
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(64))),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!(routine = %self.routine, "{message}");
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(routine = %self.routine, "{message}");
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(routine = %self.routine, "{message}");
        self.push(LogLevel::Error, message);
    }

    /// The newest `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, level: LogLevel, message: String) {
        let mut entries = self.entries.lock();
        if entries.len() == LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
    }
}
