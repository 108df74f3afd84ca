//! Error types for credential pool operations

/// Errors from credential pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no credentials available: {0}")]
    NoCredentialsAvailable(String),

    #[error("credential not found: {0}")]
    NotFound(String),
}

/// Result alias for credential pool operations.
pub type Result<T> = std::result::Result<T, Error>;
