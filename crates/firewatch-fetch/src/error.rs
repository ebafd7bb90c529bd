use std::io;

use firewatch_core::ErrorCode;
use thiserror::Error;

/// Transport error codes that are worth another attempt.
///
/// Anything not listed here (TLS failures, malformed URLs, redirect loops, ...)
/// fails the call immediately without consuming the retry budget.
pub const RETRYABLE_TRANSPORT_CODES: &[&str] = &[
    "ECONNRESET",
    "ECONNREFUSED",
    "ECONNABORTED",
    "ETIMEDOUT",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EPIPE",
];

/// Errors produced by a single upstream call or a whole retry sequence.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request never produced an HTTP response.
    #[error("Transport error ({code}): {message}")]
    Transport { code: String, message: String },

    /// HTTP 5xx or 429.
    #[error("Upstream server error: HTTP {status}")]
    UpstreamServer { status: u16, body: String },

    /// HTTP 4xx other than 429.
    #[error("Upstream client error: HTTP {status}")]
    UpstreamClient { status: u16, body: String },

    /// Every attempt allowed by the policy failed with a retryable error.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },

    /// The response arrived but its body could not be decoded.
    #[error("Invalid response body: {0}")]
    Decode(String),

    /// The HTTP client could not be constructed.
    #[error("HTTP client setup failed: {0}")]
    Client(String),
}

impl FetchError {
    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build the error for a non-success HTTP status.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        if status == 429 || status >= 500 {
            Self::UpstreamServer {
                status,
                body: body.into(),
            }
        } else {
            Self::UpstreamClient {
                status,
                body: body.into(),
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { code, .. } => RETRYABLE_TRANSPORT_CODES.contains(&code.as_str()),
            Self::UpstreamServer { .. } => true,
            Self::UpstreamClient { .. }
            | Self::ExhaustedRetries { .. }
            | Self::Decode(_)
            | Self::Client(_) => false,
        }
    }

    /// HTTP status of the (last) failed response, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::UpstreamServer { status, .. } | Self::UpstreamClient { status, .. } => {
                Some(*status)
            }
            Self::ExhaustedRetries { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Classify a `reqwest` failure into a transport code.
    ///
    /// The io::Error buried in the source chain is the most precise signal;
    /// reqwest's own flags and the resolver message are used as fallbacks.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let code = io_error_code(&err).unwrap_or_else(|| {
            if err.is_timeout() {
                "ETIMEDOUT"
            } else if is_dns_failure(&err) {
                "ENOTFOUND"
            } else if err.is_decode() {
                "EDECODE"
            } else if err.is_builder() {
                "EINVALIDREQUEST"
            } else {
                "ETRANSPORT"
            }
        });
        Self::transport(code, error_chain(&err))
    }
}

impl ErrorCode for FetchError {
    fn code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transient_network_error",
            Self::UpstreamServer { .. } => "upstream_server_error",
            Self::UpstreamClient { .. } => "upstream_client_error",
            Self::ExhaustedRetries { .. } => "exhausted_retries",
            Self::Decode(_) => "decode_error",
            Self::Client(_) => "client_error",
        }
    }
}

fn io_error_code(err: &(dyn std::error::Error + 'static)) -> Option<&'static str> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return match io_err.kind() {
                io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
                io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
                io::ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
                io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
                io::ErrorKind::BrokenPipe => Some("EPIPE"),
                _ => None,
            };
        }
        source = e.source();
    }
    None
}

fn is_dns_failure(err: &reqwest::Error) -> bool {
    let chain = error_chain(err).to_lowercase();
    chain.contains("dns error") || chain.contains("failed to lookup address")
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(e) = source {
        parts.push(e.to_string());
        source = e.source();
    }
    parts.join(": ")
}

pub type Result<T> = std::result::Result<T, FetchError>;
