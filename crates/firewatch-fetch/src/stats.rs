use std::time::Duration;

use firewatch_core::Resettable;
use serde::Serialize;

/// Retry counters accumulated across every call made by one routine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Every attempt, first tries included.
    pub total_attempts: u64,
    /// Calls that succeeded after at least one failed attempt.
    pub successful_retries: u64,
    /// Calls that ended in `ExhaustedRetries`.
    pub failed_retries: u64,
    pub longest_backoff_ms: u64,
}

impl RetryStats {
    pub fn record_backoff(&mut self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.longest_backoff_ms = self.longest_backoff_ms.max(ms);
    }
}

impl Resettable for RetryStats {
    fn reset(&mut self) {
        *self = Self::default();
    }
}
