//! Error types for proxy pool operations

/// Errors from proxy pool construction.
///
/// Selection itself never fails; it falls back to direct egress.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid proxy connection string {address}: {reason}")]
    InvalidProxy { address: String, reason: String },

    #[error("direct class cannot hold proxy endpoints")]
    DirectEndpoint,
}

/// Result alias for proxy pool operations.
pub type Result<T> = std::result::Result<T, Error>;
