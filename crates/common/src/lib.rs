//! Common types for the LLM dispatch workspace

mod error;
mod message;
mod secret;

pub use error::{Error, Result};
pub use message::{Message, Role};
pub use secret::Secret;
