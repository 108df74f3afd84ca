//! Context budgeting for chat completion requests
//!
//! Counts tokens for a conversation against a model's context limit and
//! decides how to send it:
//! 1. Fits the effective limit → pass through unchanged
//! 2. Too large → drop older turns, keeping the system message and the most
//!    recent turns
//! 3. Still too large → flatten into one text block and split into chunks that
//!    each fit the limit

pub mod budgeter;
pub mod chunk;
pub mod error;
pub mod tokens;

pub use budgeter::{BudgetConfig, ContextBudgeter, ContextStats, MESSAGE_OVERHEAD, Prepared};
pub use chunk::{ContextChunk, ContextStrategy};
pub use error::{Error, Result};
pub use tokens::TokenCounter;
