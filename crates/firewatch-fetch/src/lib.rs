//! `firewatch-fetch`: upstream HTTP calls with exponential backoff, jitter
//! and an explicit retry classification.
//!
//! | Failure                                   | Retried? |
//! |-------------------------------------------|----------|
//! | HTTP 5xx, HTTP 429                        | yes      |
//! | transport code in [`RETRYABLE_TRANSPORT_CODES`] | yes |
//! | any other transport failure               | no       |
//! | HTTP 4xx other than 429                   | no       |
//!
//! After `max_retries + 1` failed attempts the last error is wrapped in
//! [`FetchError::ExhaustedRetries`].

pub mod client;
pub mod error;
pub mod link;
pub mod policy;
pub mod stats;
pub mod transport;

pub use client::RetryableFetch;
pub use error::{FetchError, Result, RETRYABLE_TRANSPORT_CODES};
pub use link::LinkSet;
pub use policy::RetryPolicy;
pub use stats::RetryStats;
pub use transport::{FetchRequest, FetchResponse, HttpTransport, ReqwestTransport};
