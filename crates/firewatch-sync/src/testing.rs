//! In-process fakes shared by this crate's tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use firewatch_core::FirewatchConfig;
use firewatch_fetch::{
    FetchRequest, FetchResponse, HttpTransport, Result as FetchResult, RetryPolicy, RetryableFetch,
};
use parking_lot::Mutex;

use crate::upstream::Upstream;

pub(crate) const BASE: &str = "https://api.test";

pub(crate) fn config() -> FirewatchConfig {
    let mut config = FirewatchConfig::default();
    config.upstream.base_url = Some(BASE.to_string());
    config.upstream.api_token = Some("secret".to_string());
    config.dispatch.page_delay_ms = 0;
    config
}

/// Answers requests from a per-URL script; unknown URLs get a 404.
///
/// Keys are the URL plus its query string (`{url}?k=v&k2=v2`). When a key has
/// several responses queued they are served in order and the last repeats.
#[derive(Clone, Default)]
pub(crate) struct FakeUpstream {
    routes: Arc<Mutex<HashMap<String, VecDeque<FetchResponse>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeUpstream {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn route(&self, key: &str, resp: FetchResponse) {
        self.routes
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(resp);
    }

    /// Keys of every request received, in order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub(crate) fn client(&self, config: &FirewatchConfig) -> Arc<Upstream> {
        self.client_with_policy(config, RetryPolicy::no_retry())
    }

    pub(crate) fn client_with_policy(
        &self,
        config: &FirewatchConfig,
        policy: RetryPolicy,
    ) -> Arc<Upstream> {
        let fetch = RetryableFetch::new(Arc::new(self.clone()), policy);
        Arc::new(Upstream::new(fetch, Arc::new(config.clone())))
    }

    fn key(req: &FetchRequest) -> String {
        if req.query.is_empty() {
            return req.url.clone();
        }
        let query: Vec<String> = req.query.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{}?{}", req.url, query.join("&"))
    }
}

#[async_trait]
impl HttpTransport for FakeUpstream {
    async fn send(&self, req: &FetchRequest) -> FetchResult<FetchResponse> {
        assert_eq!(req.bearer_token.as_deref(), Some("secret"));
        let key = Self::key(req);
        self.calls.lock().push(key.clone());

        let mut routes = self.routes.lock();
        let resp = match routes.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(resp.unwrap_or_else(|| FetchResponse::new(404, "not found")))
    }
}

/// A page of records with an optional `rel="next"` link.
pub(crate) fn page(records: serde_json::Value, next: Option<&str>) -> FetchResponse {
    let resp = FetchResponse::new(200, records.to_string());
    match next {
        Some(url) => resp.with_header("Link", format!(r#"<{url}>; rel="next""#)),
        None => resp,
    }
}
