use std::sync::Arc;

use firewatch_core::SharedStats;
use tracing::{info, warn};

use crate::error::{FetchError, Result};
use crate::policy::RetryPolicy;
use crate::stats::RetryStats;
use crate::transport::{FetchRequest, FetchResponse, HttpTransport};

/// Upstream client that retries transient failures with capped exponential
/// backoff plus jitter.
///
/// Cloning is cheap; clones share the transport and the [`RetryStats`].
#[derive(Clone)]
pub struct RetryableFetch {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    stats: SharedStats<RetryStats>,
}

impl RetryableFetch {
    pub fn new(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            stats: SharedStats::default(),
        }
    }

    pub fn stats(&self) -> &SharedStats<RetryStats> {
        &self.stats
    }

    /// Fetch with the client's default policy.
    pub async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse> {
        self.fetch_with_policy(req, &self.policy).await
    }

    /// Perform up to `policy.max_retries + 1` attempts.
    ///
    /// Non-retryable failures are returned as-is on the attempt that produced
    /// them; retryable failures on the final attempt are wrapped in
    /// [`FetchError::ExhaustedRetries`].
    pub async fn fetch_with_policy(
        &self,
        req: &FetchRequest,
        policy: &RetryPolicy,
    ) -> Result<FetchResponse> {
        let mut last_err: Option<FetchError> = None;

        for attempt in 0..=policy.max_retries {
            self.stats.update(|s| s.total_attempts += 1);

            let outcome = match self.transport.send(req).await {
                Ok(resp) if resp.is_success() => Ok(resp),
                Ok(resp) => Err(FetchError::from_status(resp.status, resp.body)),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(resp) => {
                    if attempt > 0 {
                        self.stats.update(|s| s.successful_retries += 1);
                        info!(url = %req.url, attempt, "upstream call succeeded after retry");
                    }
                    return Ok(resp);
                }
                Err(e) if !e.is_retryable() => {
                    warn!(url = %req.url, attempt, error = %e, "upstream call failed (not retryable)");
                    return Err(e);
                }
                Err(e) => {
                    if attempt < policy.max_retries {
                        let delay = policy.jittered_delay(attempt);
                        self.stats.update(|s| s.record_backoff(delay));
                        warn!(
                            url = %req.url,
                            attempt,
                            max_retries = policy.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "upstream call failed, retrying with backoff"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_err = Some(e);
                }
            }
        }

        self.stats.update(|s| s.failed_retries += 1);
        let last = last_err.unwrap_or_else(|| FetchError::Client("no attempt was made".into()));
        warn!(url = %req.url, error = %last, "upstream call exhausted its retries");
        Err(FetchError::ExhaustedRetries {
            attempts: policy.max_attempts(),
            last: Box::new(last),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use firewatch_core::ErrorCode;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Replays a fixed script of outcomes; repeats the last one when exhausted.
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<FetchResponse>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<FetchResponse>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    fn replay(outcome: &Result<FetchResponse>) -> Result<FetchResponse> {
        match outcome {
            Ok(resp) => Ok(resp.clone()),
            Err(FetchError::Transport { code, message }) => {
                Err(FetchError::transport(code.clone(), message.clone()))
            }
            Err(other) => Err(FetchError::Client(other.to_string())),
        }
    }

    #[async_trait]
    impl HttpTransport for Scripted {
        async fn send(&self, _req: &FetchRequest) -> Result<FetchResponse> {
            *self.calls.lock() += 1;
            let mut outcomes = self.outcomes.lock();
            if outcomes.len() > 1 {
                outcomes.pop_front().unwrap()
            } else {
                replay(outcomes.front().unwrap())
            }
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            jitter_max: 0.5,
        }
    }

    fn req() -> FetchRequest {
        FetchRequest::get("https://api.test/records")
    }

    #[tokio::test]
    async fn connection_reset_is_retried() {
        let transport = Scripted::new(vec![
            Err(FetchError::transport("ECONNRESET", "connection reset by peer")),
            Ok(FetchResponse::new(200, "[]")),
        ]);
        let client = RetryableFetch::new(transport.clone(), fast_policy(3));

        let resp = client.fetch(&req()).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(transport.calls(), 2);

        let stats = client.stats().snapshot();
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(stats.successful_retries, 1);
        assert_eq!(stats.failed_retries, 0);
    }

    #[tokio::test]
    async fn not_found_propagates_immediately() {
        let transport = Scripted::new(vec![Ok(FetchResponse::new(404, "missing"))]);
        let client = RetryableFetch::new(transport.clone(), fast_policy(3));

        let err = client.fetch(&req()).await.unwrap_err();
        assert!(matches!(err, FetchError::UpstreamClient { status: 404, .. }));
        assert_eq!(transport.calls(), 1);
        assert_eq!(client.stats().snapshot().failed_retries, 0);
    }

    #[tokio::test]
    async fn redirect_is_rejected_without_retry() {
        let transport = Scripted::new(vec![Ok(FetchResponse::new(301, "moved"))]);
        let client = RetryableFetch::new(transport.clone(), fast_policy(3));

        let err = client.fetch(&req()).await.unwrap_err();
        assert!(matches!(err, FetchError::UpstreamClient { status: 301, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_transport_code_is_not_retried() {
        let transport = Scripted::new(vec![Err(FetchError::transport(
            "ETRANSPORT",
            "invalid peer certificate",
        ))]);
        let client = RetryableFetch::new(transport.clone(), fast_policy(3));

        let err = client.fetch(&req()).await.unwrap_err();
        assert_eq!(err.code(), "transient_network_error");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn server_errors_exhaust_the_budget() {
        let transport = Scripted::new(vec![Ok(FetchResponse::new(503, "busy"))]);
        let client = RetryableFetch::new(transport.clone(), fast_policy(3));

        let err = client.fetch(&req()).await.unwrap_err();
        match err {
            FetchError::ExhaustedRetries { attempts, last } => {
                assert_eq!(attempts, 4);
                assert_eq!(last.status(), Some(503));
            }
            other => panic!("expected ExhaustedRetries, got {other:?}"),
        }
        assert_eq!(transport.calls(), 4);

        let stats = client.stats().snapshot();
        assert_eq!(stats.total_attempts, 4);
        assert_eq!(stats.failed_retries, 1);
        // three sleeps, the largest capped at 4ms plus at most 50% jitter
        assert!(stats.longest_backoff_ms <= 6);
    }

    #[tokio::test]
    async fn rate_limit_then_success() {
        let transport = Scripted::new(vec![
            Ok(FetchResponse::new(429, "slow down")),
            Ok(FetchResponse::new(429, "slow down")),
            Ok(FetchResponse::new(200, "[1]")),
        ]);
        let client = RetryableFetch::new(transport.clone(), fast_policy(2));

        let resp = client.fetch(&req()).await.unwrap();
        assert_eq!(resp.json::<Vec<u32>>().unwrap(), vec![1]);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let transport = Scripted::new(vec![Ok(FetchResponse::new(500, "boom"))]);
        let client = RetryableFetch::new(transport.clone(), fast_policy(0));

        let err = client.fetch(&req()).await.unwrap_err();
        assert!(matches!(err, FetchError::ExhaustedRetries { attempts: 1, .. }));
        assert_eq!(transport.calls(), 1);
    }
}
