//! Outcome classification for upstream responses and transport failures
//!
//! Decides what the router does next with each attempt: accept, back off,
//! give up immediately, retry, or switch egress path.

/// Error body phrases meaning the prompt exceeded the model's context window.
///
/// Matched case-insensitively. OpenAI-compatible APIs report this with a 400
/// rather than a 413, so the body has to be inspected.
const CONTEXT_PATTERNS: &[&str] = &[
    "context_length_exceeded",
    "context length",
    "context window",
    "maximum context",
    "too many tokens",
    "reduce the length",
    "request too large",
];

/// Classification of an HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// 2xx
    Success,
    /// 429, retry after backoff
    RateLimited,
    /// 413 or context-size body, never retried
    ContextTooLarge,
    /// Any other status, retried until attempts run out
    Error,
}

/// Classification of a request that produced no HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportClass {
    /// Failure while going through a proxy; rotate and downgrade
    Proxy,
    /// Request or connect timeout
    Timeout,
    /// Anything else (DNS, reset, TLS, body decode)
    Network,
}

/// Whether an error body describes a context-size failure.
pub fn is_context_error(body: &str) -> bool {
    let lower = body.to_lowercase();
    CONTEXT_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

/// Classify an upstream response by status and body.
pub fn classify_response(status: u16, body: &str) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Success,
        429 => ResponseClass::RateLimited,
        413 => ResponseClass::ContextTooLarge,
        _ if is_context_error(body) => ResponseClass::ContextTooLarge,
        _ => ResponseClass::Error,
    }
}

/// Classify a transport failure.
///
/// Through a proxy, every failure except a timeout is blamed on the proxy.
/// Timeouts stay network errors because a slow model is the likelier cause.
pub fn classify_transport(error: &reqwest::Error, via_proxy: bool) -> TransportClass {
    if error.is_timeout() {
        TransportClass::Timeout
    } else if via_proxy {
        TransportClass::Proxy
    } else {
        TransportClass::Network
    }
}
