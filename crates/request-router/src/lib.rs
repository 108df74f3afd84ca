//! Request routing for chat completion calls
//!
//! Turns one logical completion request into a reliable upstream call: picks
//! a credential and an egress path, sends the request, classifies the outcome
//! and retries with backoff or a proxy downgrade as needed. Failures are
//! returned as a typed [`RequestOutcome`], never as an `Err`.
//!
//! [`LlmClient`] layers context budgeting on top: oversized conversations are
//! compressed or chunked before they reach the router.

pub mod classify;
pub mod client;
pub mod error;
pub mod outcome;
pub mod payload;
pub mod router;

pub use client::{ChunkResult, ClientConfig, LlmClient, SessionStats};
pub use error::{Error, Result};
pub use outcome::{Dispatch, RequestOutcome, RequestStatus};
pub use payload::ChatOptions;
pub use router::{RequestRouter, RouterConfig, RouterStats};
