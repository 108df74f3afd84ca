//! LLM dispatch gateway
//!
//! Single-binary service that:
//! 1. Pools upstream API keys with cooldowns and failure tracking
//! 2. Routes requests through mobile/residential proxies with direct fallback
//! 3. Budgets conversations against the model's context window
//! 4. Retries failed completions and reports a typed outcome per request

mod api;
mod config;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use context_budget::ContextBudgeter;
use credential_pool::CredentialPool;
use metrics_exporter_prometheus::PrometheusHandle;
use proxy_pool::{ProxyPool, spawn_health_task};
use request_router::{LlmClient, RequestRouter};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{ApiState, ChatBody, PrepareBody};
use crate::config::Config;

/// Time allowed for in-flight requests to finish after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    api: ApiState,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/chat", post(chat_handler))
        .route("/v1/context/prepare", post(prepare_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting llm-dispatch");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.router.base_url,
        credentials = config.credentials.keys.len(),
        mobile_proxies = config.proxies.mobile.len(),
        residential_proxies = config.proxies.residential.len(),
        "configuration loaded"
    );
    if config.credentials.keys.is_empty() {
        warn!("no API keys configured; set LLM_API_KEYS or credentials.keys_file");
    }

    let keys = std::mem::take(&mut config.credentials.keys);
    let credentials = Arc::new(CredentialPool::new(keys, config.credentials.pool.clone()));
    let proxies = Arc::new(
        ProxyPool::new(config.proxies.clone()).context("failed to build proxy pool")?,
    );
    let budgeter = Arc::new(ContextBudgeter::new(config.budget.clone()));
    let router = Arc::new(RequestRouter::new(
        credentials,
        proxies.clone(),
        config.router.clone(),
    ));
    let client = Arc::new(LlmClient::new(router, budgeter, config.client.clone()));

    let shutdown = CancellationToken::new();
    let health_task = spawn_health_task(
        proxies,
        config.proxies.health_check_interval(),
        shutdown.clone(),
    );

    let app_state = AppState {
        api: ApiState {
            client,
            shutdown: shutdown.clone(),
        },
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
    });

    shutdown_signal().await;

    // Stops the listener, cancels in-flight upstream calls and the health task
    shutdown.cancel();

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }
    if let Err(e) = health_task.await {
        error!(error = %e, "proxy health task panicked");
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: router, credential and proxy status.
/// Returns 200 while at least one credential is usable, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let client = &state.api.client;
    let router_status = client.router().status().await;
    let available = router_status["credentials"]["credentials_available"]
        .as_u64()
        .unwrap_or(0);

    let (status_code, status) = if available > 0 {
        (axum::http::StatusCode::OK, "healthy")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };
    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "session": client.session_stats(),
        "router": router_status,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn chat_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<ChatBody>,
) -> Response {
    api::chat(&state.api, body, new_request_id()).await
}

async fn prepare_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<PrepareBody>,
) -> Response {
    api::prepare(&state.api, body, new_request_id()).await
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use common::Secret;
    use context_budget::{BudgetConfig, TokenCounter};
    use credential_pool::PoolConfig;
    use proxy_pool::{ProxyClass, ProxyPoolConfig};
    use request_router::{ClientConfig, RouterConfig};
    use tower::ServiceExt;

    /// App state with a heuristic budgeter (effective limit 800) pointed at `base_url`.
    fn test_state(base_url: &str, keys: &[&str]) -> AppState {
        let credentials = Arc::new(CredentialPool::new(
            keys.iter().map(|k| Secret::new(k.to_string())).collect(),
            PoolConfig::default(),
        ));
        let proxies = Arc::new(ProxyPool::new(ProxyPoolConfig::default()).unwrap());
        let router = Arc::new(RequestRouter::new(
            credentials,
            proxies,
            RouterConfig {
                base_url: base_url.to_string(),
                max_retries: 0,
                proxy_preference: ProxyClass::Direct,
                ..RouterConfig::default()
            },
        ));
        let budgeter = Arc::new(ContextBudgeter::with_counter(
            TokenCounter::Heuristic,
            BudgetConfig {
                default_limit: 1000,
                response_reserve: 200,
                model_limits: Default::default(),
                ..BudgetConfig::default()
            },
        ));
        let (_recorder, prometheus) = metrics::isolated_recorder();

        AppState {
            api: ApiState {
                client: Arc::new(LlmClient::new(router, budgeter, ClientConfig::default())),
                shutdown: CancellationToken::new(),
            },
            prometheus,
            started_at: Instant::now(),
        }
    }

    /// Mock completion API answering every call with `status` and `body`.
    async fn start_upstream(status: u16, body: serde_json::Value) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let body = body.clone();
                async move { (StatusCode::from_u16(status).unwrap(), axum::Json(body)) }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    async fn call(
        app: Router,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(if method == "GET" {
                Body::empty()
            } else {
                Body::from(body.to_string())
            })
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or_default())
    }

    #[tokio::test]
    async fn health_is_unavailable_without_credentials() {
        let app = build_router(test_state("http://127.0.0.1:9", &[]), 1000);
        let (status, json) = call(app, "GET", "/health", serde_json::Value::Null).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["router"]["credentials"]["credentials_total"], 0);
    }

    #[tokio::test]
    async fn health_reports_router_status() {
        let app = build_router(test_state("http://127.0.0.1:9", &["gsk_test_0001"]), 1000);
        let (status, json) = call(app, "GET", "/health", serde_json::Value::Null).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["router"]["current_model"], "llama-3.3-70b-versatile");
        assert_eq!(json["router"]["proxies"]["endpoints_total"], 0);
        assert_eq!(json["session"]["requests"], 0);
        // Keys only ever appear masked
        assert!(!json.to_string().contains("gsk_test_0001"));
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text() {
        let app = build_router(test_state("http://127.0.0.1:9", &[]), 1000);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn chat_returns_completion() {
        let url = start_upstream(
            200,
            serde_json::json!({"choices": [{"message": {"role": "assistant", "content": "Yes, it is."}}]}),
        )
        .await;
        let app = build_router(test_state(&url, &["gsk_test_0001"]), 1000);

        let (status, json) = call(
            app,
            "POST",
            "/v1/chat",
            serde_json::json!({"messages": [{"role": "user", "content": "Is the lease assignable?"}]}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "success");
        assert_eq!(json["content"], "Yes, it is.");
        assert_eq!(json["attempts"], 1);
        assert!(json["request_id"].as_str().unwrap().starts_with("req_"));
        assert!(json["error"].is_null());
    }

    #[tokio::test]
    async fn chat_maps_rate_limit_to_429() {
        let url = start_upstream(429, serde_json::json!({"error": "rate limited"})).await;
        let app = build_router(test_state(&url, &["gsk_test_0001"]), 1000);

        let (status, json) = call(
            app,
            "POST",
            "/v1/chat",
            serde_json::json!({"messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json["status"], "rate_limited");
        assert!(json["content"].is_null());
        assert!(json["debug"].as_str().unwrap().contains("...0001"));
    }

    #[tokio::test]
    async fn chat_rejects_empty_messages() {
        let app = build_router(test_state("http://127.0.0.1:9", &["gsk_test_0001"]), 1000);
        let (status, json) = call(app, "POST", "/v1/chat", serde_json::json!({"messages": []})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn chat_during_shutdown_is_cancelled() {
        let state = test_state("http://127.0.0.1:9", &["gsk_test_0001"]);
        state.api.shutdown.cancel();
        let app = build_router(state, 1000);

        let (status, json) = call(
            app,
            "POST",
            "/v1/chat",
            serde_json::json!({"messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "cancelled");
    }

    #[tokio::test]
    async fn oversized_chat_is_refused_locally() {
        let app = build_router(test_state("http://127.0.0.1:9", &["gsk_test_0001"]), 1000);
        let (status, json) = call(
            app,
            "POST",
            "/v1/chat",
            serde_json::json!({"messages": [{"role": "user", "content": "x".repeat(8000)}]}),
        )
        .await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json["status"], "context_too_large");
        assert_eq!(json["attempts"], 0);
    }

    #[tokio::test]
    async fn prepare_chunks_oversized_conversation() {
        let app = build_router(test_state("http://127.0.0.1:9", &[]), 1000);
        let (status, json) = call(
            app,
            "POST",
            "/v1/context/prepare",
            serde_json::json!({
                "messages": [{"role": "user", "content": "Rent is due monthly. ".repeat(300)}],
                "strategy": "simple_chunk"
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["fits"], false);
        assert_eq!(json["strategy"], "simple");
        let chunks = json["chunks"].as_array().unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c["token_count"].as_u64().unwrap() <= 800));
        assert_eq!(json["stats"]["effective_limit"], 800);
        assert_eq!(json["stats"]["fits"], false);
    }

    #[tokio::test]
    async fn prepare_passes_fitting_conversation() {
        let app = build_router(test_state("http://127.0.0.1:9", &[]), 1000);
        let (status, json) = call(
            app,
            "POST",
            "/v1/context/prepare",
            serde_json::json!({"messages": [{"role": "user", "content": "short"}], "model": "gemma2-9b-it"}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["fits"], true);
        assert_eq!(json["model"], "gemma2-9b-it");
        assert_eq!(json["messages"][0]["content"], "short");
        assert!(json["chunks"].is_null());
    }

    #[tokio::test]
    async fn prepare_rejects_unknown_strategy() {
        let app = build_router(test_state("http://127.0.0.1:9", &[]), 1000);
        let (status, json) = call(
            app,
            "POST",
            "/v1/context/prepare",
            serde_json::json!({"messages": [], "strategy": "rolling"}),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]["message"].as_str().unwrap().contains("rolling"));
    }
}
