//! Error types shared across Wharf crates

use thiserror::Error;

/// Result type alias for Wharf operations
pub type Result<T> = std::result::Result<T, WharfError>;

/// Failures that are not tied to a single component
#[derive(Error, Debug)]
pub enum WharfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A status column held a value outside the known set
    #[error("Invalid {kind} status: {value}")]
    InvalidStatus { kind: &'static str, value: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WharfError {
    pub fn invalid_status(kind: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidStatus {
            kind,
            value: value.into(),
        }
    }
}
