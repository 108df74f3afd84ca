//! Classified results of a routed request

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Outcome kind, for logs, metrics labels and API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Success,
    RateLimited,
    ContextTooLarge,
    ApiError,
    ProxyError,
    NetworkError,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::RateLimited => "rate_limited",
            RequestStatus::ContextTooLarge => "context_too_large",
            RequestStatus::ApiError => "api_error",
            RequestStatus::ProxyError => "proxy_error",
            RequestStatus::NetworkError => "network_error",
            RequestStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a request, with the data each case carries.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// 2xx with the decoded response body
    Success(serde_json::Value),
    /// 429 on every attempt
    RateLimited,
    /// 413, or an error body saying the prompt is too long
    ContextTooLarge(String),
    /// Any other non-2xx. `status` is `None` when no request could be made.
    ApiError { status: Option<u16>, body: String },
    /// Failure connecting through the proxy
    ProxyError(String),
    /// Timeout or other transport failure
    NetworkError(String),
    /// The caller's cancellation token fired
    Cancelled,
}

impl RequestOutcome {
    pub fn status(&self) -> RequestStatus {
        match self {
            RequestOutcome::Success(_) => RequestStatus::Success,
            RequestOutcome::RateLimited => RequestStatus::RateLimited,
            RequestOutcome::ContextTooLarge(_) => RequestStatus::ContextTooLarge,
            RequestOutcome::ApiError { .. } => RequestStatus::ApiError,
            RequestOutcome::ProxyError(_) => RequestStatus::ProxyError,
            RequestOutcome::NetworkError(_) => RequestStatus::NetworkError,
            RequestOutcome::Cancelled => RequestStatus::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success(_))
    }

    /// Failure detail for error responses, `None` on success.
    pub fn detail(&self) -> Option<String> {
        match self {
            RequestOutcome::Success(_) => None,
            RequestOutcome::RateLimited => Some("rate limited".to_string()),
            RequestOutcome::ContextTooLarge(detail)
            | RequestOutcome::ProxyError(detail)
            | RequestOutcome::NetworkError(detail) => Some(detail.clone()),
            RequestOutcome::ApiError {
                status: Some(status),
                body,
            } => Some(format!("HTTP {status}: {body}")),
            RequestOutcome::ApiError { status: None, body } => Some(body.clone()),
            RequestOutcome::Cancelled => Some("cancelled".to_string()),
        }
    }
}

/// Final result of one routed request.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub outcome: RequestOutcome,
    /// Masked credential, egress path and timing; safe to log
    pub debug: String,
    /// Upstream attempts made (0 if the request never left the process)
    pub attempts: u32,
    pub elapsed: Duration,
}

impl Dispatch {
    /// A dispatch that ended before any attempt was made.
    pub fn local(outcome: RequestOutcome, debug: impl Into<String>) -> Self {
        Self {
            outcome,
            debug: debug.into(),
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.outcome.status()
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn response(&self) -> Option<&serde_json::Value> {
        match &self.outcome {
            RequestOutcome::Success(body) => Some(body),
            _ => None,
        }
    }

    /// `choices[0].message.content` of a successful response.
    pub fn content(&self) -> Option<&str> {
        self.first_message()?.get("content")?.as_str()
    }

    /// `choices[0].message.tool_calls` of a successful response.
    pub fn tool_calls(&self) -> Option<&Vec<serde_json::Value>> {
        self.first_message()?.get("tool_calls")?.as_array()
    }

    fn first_message(&self) -> Option<&serde_json::Value> {
        self.response()?.get("choices")?.get(0)?.get("message")
    }
}
