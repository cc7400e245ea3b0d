//! Error types for metacoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Construction Errors ===
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Store Errors ===
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store is closed")]
    Closed,

    // === Coordination Errors ===
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Unsupported metastore event: {0}")]
    UnsupportedEvent(String),

    // === Lock Errors ===
    #[error("Lock not held: {0}")]
    LockNotHeld(String),

    #[error("Lock session invalid: {0}")]
    SessionInvalid(String),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Can the caller reasonably re-issue the same call?
    ///
    /// Nothing inside this crate retries; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Etcd(_))
    }

    /// Is this a missing-path error?
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::InvalidUri(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
