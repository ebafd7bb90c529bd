use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Number of recent execution durations kept for averaging.
pub const EXECUTION_HISTORY: usize = 10;

/// Identity of a scheduled routine. Immutable after construction.
#[derive(Debug, Clone)]
pub struct RoutineDescriptor {
    pub name: String,
    pub interval: Duration,
}

impl RoutineDescriptor {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
        }
    }
}

/// Why a routine last stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReason {
    pub message: String,
    /// Full error chain when the stop was caused by a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub at: DateTime<Utc>,
}

impl StopReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            at: Utc::now(),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// Point-in-time snapshot returned by every control operation.
#[derive(Debug, Clone, Serialize)]
pub struct RoutineStatus {
    pub name: String,
    pub running: bool,
    pub interval_ms: u64,
    pub execution_count: u64,
    /// Mean of the last [`EXECUTION_HISTORY`] durations.
    pub average_execution_time_ms: Option<u64>,
    pub last_execution_time_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_execution_at: Option<DateTime<Utc>>,
    /// `last_execution_at` (or `started_at`) + interval, while running.
    pub next_execution_estimate: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
    /// Executions started but not yet finished.
    pub in_flight: usize,
}

/// Bounded ring of recent execution durations.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecutionTimes {
    samples: VecDeque<Duration>,
}

impl ExecutionTimes {
    pub(crate) fn push(&mut self, elapsed: Duration) {
        if self.samples.len() == EXECUTION_HISTORY {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    pub(crate) fn last(&self) -> Option<Duration> {
        self.samples.back().copied()
    }

    pub(crate) fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    pub(crate) fn clear(&mut self) {
        self.samples.clear();
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_only_recent_samples() {
        let mut times = ExecutionTimes::default();
        for ms in 1..=15 {
            times.push(Duration::from_millis(ms));
        }
        assert_eq!(times.len(), EXECUTION_HISTORY);
        assert_eq!(times.last(), Some(Duration::from_millis(15)));
        // samples 6..=15 remain, mean 10.5ms
        assert_eq!(times.average(), Some(Duration::from_micros(10_500)));
    }

    #[test]
    fn empty_ring_has_no_average() {
        let times = ExecutionTimes::default();
        assert_eq!(times.average(), None);
        assert_eq!(times.last(), None);
    }
}
