//! `firewatch-core`: configuration, shared error codes and statistics
//! plumbing used by every other firewatch crate.

pub mod config;
pub mod error;
pub mod stats;

pub use config::FirewatchConfig;
pub use error::{CoreError, ErrorCode, Result};
pub use stats::{Resettable, SharedStats};
