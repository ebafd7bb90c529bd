use std::time::Duration;

use firewatch_core::config::RetryConfig;
use rand::Rng;

/// Backoff schedule for one upstream call.
///
/// `capped_delay(a) = min(base_delay * backoff_multiplier^a, max_delay)`; the
/// realised delay adds `capped_delay(a) * jitter_max * U(0,1)` on top.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_max: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            backoff_multiplier: cfg.backoff_multiplier.max(1.0),
            jitter_max: if cfg.jitter_max.is_nan() {
                0.0
            } else {
                cfg.jitter_max.clamp(0.0, 1.0)
            },
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries. Used for best-effort calls.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total attempts this policy allows, including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Pre-jitter delay after failed attempt `attempt` (0-indexed).
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.base_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.max(0.0) as u64)
    }

    /// Delay with jitter, where `unit` is a sample from `[0, 1]`.
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let capped = self.capped_delay(attempt);
        capped + capped.mul_f64(self.jitter_max * unit.clamp(0.0, 1.0))
    }

    /// Delay with a fresh random jitter sample.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let unit: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with_jitter(attempt, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter_max: 0.25,
        }
    }

    #[test]
    fn exponential_growth_until_cap() {
        let p = policy();
        assert_eq!(p.capped_delay(0), Duration::from_millis(100));
        assert_eq!(p.capped_delay(1), Duration::from_millis(200));
        assert_eq!(p.capped_delay(3), Duration::from_millis(800));
        // 100ms * 2^5 = 3.2s, capped at 2s
        assert_eq!(p.capped_delay(5), Duration::from_secs(2));
    }

    #[test]
    fn backoff_is_monotonic_and_bounded() {
        let p = policy();
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let d = p.capped_delay(attempt);
            assert!(d >= previous, "attempt {attempt}: {d:?} < {previous:?}");
            assert!(d <= p.max_delay);
            previous = d;
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let p = policy();
        assert_eq!(p.capped_delay(u32::MAX), p.max_delay);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = policy();
        for attempt in 0..8 {
            let capped = p.capped_delay(attempt);
            let upper = capped + capped.mul_f64(p.jitter_max);
            assert_eq!(p.delay_with_jitter(attempt, 0.0), capped);
            assert_eq!(p.delay_with_jitter(attempt, 1.0), upper);
            for _ in 0..50 {
                let d = p.jittered_delay(attempt);
                assert!(d >= capped && d <= upper, "attempt {attempt}: {d:?}");
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let p = RetryPolicy {
            jitter_max: 0.0,
            ..policy()
        };
        assert_eq!(p.jittered_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn config_values_are_sanitised() {
        let cfg = RetryConfig {
            max_retries: 2,
            base_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 0.5,
            jitter_max: 3.0,
        };
        let p = RetryPolicy::from(&cfg);
        assert_eq!(p.backoff_multiplier, 1.0);
        assert_eq!(p.jitter_max, 1.0);
        assert_eq!(p.max_attempts(), 3);
    }
}
