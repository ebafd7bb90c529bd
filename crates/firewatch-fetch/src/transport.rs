use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{FetchError, Result};
use crate::link::LinkSet;

const USER_AGENT: &str = concat!("firewatch/", env!("CARGO_PKG_VERSION"));

/// A single upstream GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub bearer_token: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            bearer_token: None,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Value of the first query parameter named `key`.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A fully buffered upstream response. Header names are lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    /// 2xx only. Redirects reqwest did not follow are failures.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn links(&self) -> LinkSet {
        self.header("link").map(LinkSet::parse).unwrap_or_default()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

/// Sends one request and returns whatever the server answered.
///
/// Implementations report transport failures as [`FetchError::Transport`] and
/// must not interpret HTTP status codes; classification happens in
/// [`crate::RetryableFetch`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, req: &FetchRequest) -> Result<FetchResponse>;
}

/// Production transport backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// `timeout` bounds each attempt; there is no deadline across retries.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, req: &FetchRequest) -> Result<FetchResponse> {
        let mut builder = self
            .client
            .get(&req.url)
            .header("Accept", "application/json")
            .query(&req.query);
        if let Some(ref token) = req.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let resp = builder.send().await.map_err(FetchError::from_reqwest)?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();
        let body = resp.text().await.map_err(FetchError::from_reqwest)?;

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}
