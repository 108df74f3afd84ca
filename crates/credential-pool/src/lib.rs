//! Credential pool for LLM API keys
//!
//! Holds every configured API key with per-key error accounting and selects
//! keys round-robin. The router reports each request outcome back to the pool,
//! which drives the per-key state machine.
//!
//! Credential lifecycle:
//! 1. Keys are loaded from configuration at startup → `healthy`
//! 2. Pool selects a key round-robin (or the pinned key under manual override)
//! 3. Upstream returns 429 → key cools down for `cooldown_secs`
//! 4. Upstream returns 401/403 → key disabled
//! 5. Other error statuses accumulate; at `error_threshold` the key is disabled
//! 6. A success resets the error counter; cooldown expiry restores selection

pub mod error;
pub mod pool;

pub use error::{Error, Result};
pub use pool::{CredentialInfo, CredentialPool, FailureKind, PoolConfig, SelectedCredential};
