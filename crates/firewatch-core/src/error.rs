use thiserror::Error;

/// Errors that carry a stable, machine-readable code.
///
/// The code is what control-surface clients branch on; the `Display` text is
/// for humans and may change.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A credential or URL the routine cannot run without is absent.
    #[error("Missing required configuration: {key}")]
    ConfigurationMissing { key: String },
}

impl ErrorCode for CoreError {
    fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "config_error",
            CoreError::ConfigurationMissing { .. } => "configuration_missing",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
