//! Error types for router configuration changes
//!
//! Request failures are not errors here; they are reported through
//! [`crate::RequestOutcome`].

/// Errors from router control operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error(transparent)]
    Credential(#[from] credential_pool::Error),
}

/// Result alias for router control operations.
pub type Result<T> = std::result::Result<T, Error>;
