//! Error types for the pairing service.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised on the pairing and credential paths.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("Invalid pairing code")]
    InvalidCode,

    #[error("Pairing code has expired")]
    CodeExpired,

    #[error("Pairing code already used")]
    CodeAlreadyUsed,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Failed to generate secret: {0}")]
    Generation(String),
}

impl PairingError {
    /// Stable machine-readable code used in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCode => "INVALID_CODE",
            Self::CodeExpired => "CODE_EXPIRED",
            Self::CodeAlreadyUsed => "CODE_USED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::Generation(_) => "GENERATION_FAILED",
        }
    }

    /// Whether the error comes from the caller's input rather than the service.
    pub fn is_auth_failure(&self) -> bool {
        !matches!(self, Self::Generation(_))
    }
}

/// Errors raised while saving or loading the credential snapshot.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode auth state: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode auth state from {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Saving auth state timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
