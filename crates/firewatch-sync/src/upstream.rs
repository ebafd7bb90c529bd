use std::sync::Arc;

use firewatch_core::FirewatchConfig;
use firewatch_fetch::{FetchRequest, FetchResponse, RetryPolicy, RetryableFetch};
use serde_json::Value;

use crate::error::Result;

/// The dispatch API's endpoints, resolved from config on every call so a
/// missing credential surfaces as `ConfigurationMissing` where it is used.
pub struct Upstream {
    fetch: RetryableFetch,
    config: Arc<FirewatchConfig>,
}

impl Upstream {
    pub fn new(fetch: RetryableFetch, config: Arc<FirewatchConfig>) -> Self {
        Self { fetch, config }
    }

    pub fn fetch(&self) -> &RetryableFetch {
        &self.fetch
    }

    /// Fail with `ConfigurationMissing` unless both URL and token are set.
    pub fn check_credentials(&self) -> Result<()> {
        self.config.upstream.require_base_url()?;
        self.config.upstream.require_api_token()?;
        Ok(())
    }

    /// `GET {base}/records`, authorized.
    pub fn records(&self) -> Result<FetchRequest> {
        let url = format!("{}/records", self.config.upstream.require_base_url()?);
        self.authorized(url)
    }

    /// Follow a pagination link exactly as the server gave it.
    pub fn follow(&self, url: &str) -> Result<FetchRequest> {
        self.authorized(url.to_string())
    }

    pub async fn send(&self, req: &FetchRequest) -> Result<FetchResponse> {
        Ok(self.fetch.fetch(req).await?)
    }

    /// `GET {base}/cross-ref/{id}`, decoded as a JSON object.
    ///
    /// Enrichment is best-effort and retried on the next poll anyway, so this
    /// makes a single attempt and never sleeps on backoff.
    pub async fn cross_reference(&self, id: &str) -> Result<Value> {
        let url = format!(
            "{}/cross-ref/{id}",
            self.config.upstream.require_base_url()?
        );
        let req = self.authorized(url)?;
        let resp = self
            .fetch
            .fetch_with_policy(&req, &RetryPolicy::no_retry())
            .await?;
        Ok(resp.json()?)
    }

    fn authorized(&self, url: String) -> Result<FetchRequest> {
        let token = self.config.upstream.require_api_token()?;
        Ok(FetchRequest::get(url).bearer(token))
    }
}
