//! Error types for context budgeting

/// Errors from context budgeting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown context strategy: {0}")]
    UnknownStrategy(String),
}

/// Result alias for context budgeting.
pub type Result<T> = std::result::Result<T, Error>;
