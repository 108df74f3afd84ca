//! Completion and context-preparation endpoints
//!
//! Request failures from the router are mapped to HTTP statuses here; the
//! response body always carries the outcome status and the masked debug line.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::Message;
use context_budget::ContextStrategy;
use request_router::{LlmClient, RequestStatus};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::metrics::record_gateway_request;

/// Shared state for the API handlers
#[derive(Clone)]
pub struct ApiState {
    pub client: Arc<LlmClient>,
    /// Cancelled on shutdown; every request runs under a child token
    pub shutdown: CancellationToken,
}

/// Body of `POST /v1/chat`
#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<serde_json::Value>>,
}

/// Body of `POST /v1/context/prepare`
#[derive(Debug, Deserialize)]
pub struct PrepareBody {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
}

/// JSON error response: {"error":{"type":"invalid_request","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let kind = if status.is_server_error() {
        "internal_error"
    } else {
        "invalid_request"
    };
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// HTTP status returned for each request outcome.
pub fn http_status(status: RequestStatus) -> StatusCode {
    match status {
        RequestStatus::Success => StatusCode::OK,
        RequestStatus::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        RequestStatus::ContextTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        RequestStatus::ApiError | RequestStatus::ProxyError => StatusCode::BAD_GATEWAY,
        RequestStatus::NetworkError => StatusCode::GATEWAY_TIMEOUT,
        RequestStatus::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Run a chat completion through the client. Requests with tools use the
/// function-calling path.
#[instrument(skip_all, fields(request_id = %request_id, messages = body.messages.len()))]
pub async fn chat(state: &ApiState, body: ChatBody, request_id: String) -> Response {
    if body.messages.is_empty() {
        record_gateway_request("/v1/chat", StatusCode::BAD_REQUEST.as_u16());
        return error_response(
            StatusCode::BAD_REQUEST,
            "messages must not be empty",
            &request_id,
        );
    }

    let cancel = state.shutdown.child_token();
    let model = body.model.as_deref();
    let dispatch = match body.tools.filter(|tools| !tools.is_empty()) {
        Some(tools) => {
            state
                .client
                .function_call(&body.messages, tools, model, &cancel)
                .await
        }
        None => state.client.chat(&body.messages, model, &cancel).await,
    };

    let status = http_status(dispatch.status());
    record_gateway_request("/v1/chat", status.as_u16());
    if dispatch.is_success() {
        info!(attempts = dispatch.attempts, "chat completed");
    } else {
        warn!(status = %dispatch.status(), summary = %dispatch.debug, "chat failed");
    }

    json_response(
        status,
        serde_json::json!({
            "request_id": request_id,
            "status": dispatch.status(),
            "content": dispatch.content(),
            "tool_calls": dispatch.tool_calls(),
            "response": dispatch.response(),
            "error": dispatch.outcome.detail(),
            "debug": dispatch.debug,
            "attempts": dispatch.attempts,
            "elapsed_ms": dispatch.elapsed.as_millis() as u64,
        }),
    )
}

/// Budget a conversation without sending it.
#[instrument(skip_all, fields(request_id = %request_id, messages = body.messages.len()))]
pub async fn prepare(state: &ApiState, body: PrepareBody, request_id: String) -> Response {
    let strategy = match body.strategy.as_deref().map(str::parse::<ContextStrategy>) {
        None => ContextStrategy::default(),
        Some(Ok(strategy)) => strategy,
        Some(Err(e)) => {
            record_gateway_request("/v1/context/prepare", StatusCode::BAD_REQUEST.as_u16());
            return error_response(StatusCode::BAD_REQUEST, &e.to_string(), &request_id);
        }
    };

    let model = match body.model {
        Some(model) => model,
        None => state.client.router().current_model().await,
    };
    let messages = body.messages;
    let budget_model = model.clone();
    let budgeted = state
        .client
        .with_budgeter(move |b| {
            let stats = b.context_stats(&messages, &budget_model);
            (stats, b.prepare(&messages, &budget_model, strategy))
        })
        .await;
    let (stats, prepared) = match budgeted {
        Ok(budgeted) => budgeted,
        Err(e) => {
            error!(error = %e, "context budgeting failed");
            record_gateway_request(
                "/v1/context/prepare",
                StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            );
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "context budgeting failed",
                &request_id,
            );
        }
    };

    record_gateway_request("/v1/context/prepare", StatusCode::OK.as_u16());
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "request_id": request_id,
            "model": model,
            "strategy": strategy,
            "fits": prepared.fits,
            "messages": prepared.messages,
            "chunks": prepared.chunks,
            "stats": stats,
        }),
    )
}
