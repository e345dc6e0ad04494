//! Error types for rsmediakeys.

use thiserror::Error;

/// Main error type for rsmediakeys operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A required argument was empty or malformed (key system, MIME type,
    /// initialization data, key response).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The key system is unknown, or does not support the requested MIME type.
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// The session is closed or no longer attached to its key manager.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Too many sessions are open on a CDM.
    #[error("Too many sessions open (max {max})")]
    TooManySessions { max: usize },

    /// The initialization data could not be parsed or names no key ids.
    #[error("Invalid init data: {0}")]
    InvalidInitData(String),

    /// Registry configuration is inconsistent.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Failed to parse YAML configuration.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Failed to parse or write JSON.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Name of the host exception class a binding layer should raise.
    #[must_use]
    pub fn exception_name(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) | Error::InvalidInitData(_) => "InvalidAccessError",
            Error::Unsupported(_) => "NotSupportedError",
            Error::InvalidState(_) => "InvalidStateError",
            Error::TooManySessions { .. } => "QuotaExceededError",
            _ => "UnknownError",
        }
    }
}

/// Result type alias for rsmediakeys operations.
pub type Result<T> = std::result::Result<T, Error>;
