//! Retry state machine for upstream completion calls
//!
//! Per logical request, up to `max_retries` additional attempts:
//! 1. Select a credential and an egress path (preferred proxy class, with
//!    fallback down to direct)
//! 2. POST the payload with bearer auth and the request timeout
//! 3. Classify the result:
//!    - 2xx → success, credential error count reset
//!    - 429 → credential cools down, exponential backoff, retry
//!    - 413 / context-size body → returned immediately
//!    - other status → counted against the credential, retry
//!    - proxy failure → proxy marked failed, class rotated and downgraded, retry
//!    - timeout / network failure → retry
//! 4. When attempts run out the last classification is returned

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use common::Message;
use credential_pool::{CredentialPool, FailureKind, SelectedCredential};
use proxy_pool::{ProxyClass, ProxyPool, ProxyRoute};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{ResponseClass, TransportClass, classify_response, classify_transport};
use crate::error::{Error, Result};
use crate::outcome::{Dispatch, RequestOutcome, RequestStatus};
use crate::payload::{ChatOptions, ChatRequest, ensure_model};

/// Router configuration, usually deserialized from the `[router]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// OpenAI-compatible API root; `/chat/completions` is appended
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-attempt request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts after the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First 429 backoff; doubles per attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for a single backoff
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Model used when a payload names none
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Model used for tool calling when the caller names none
    #[serde(default = "default_model")]
    pub function_model: String,

    /// Models `set_model` accepts
    #[serde(default = "default_models")]
    pub models: Vec<String>,

    /// Egress class tried first
    #[serde(default = "default_proxy_preference")]
    pub proxy_preference: ProxyClass,

    /// Default response token budget for chat completions
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Default sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_models() -> Vec<String> {
    [
        "deepseek-r1-distill-llama-70b",
        "llama-3.3-70b-versatile",
        "llama-3.1-70b-versatile",
        "llama-3.1-8b-instant",
        "gemma2-9b-it",
        "meta-llama/llama-4-scout-17b-16e-instruct",
        "meta-llama/llama-4-maverick-17b-128e-instruct",
        "moonshotai/kimi-k2-instruct",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_proxy_preference() -> ProxyClass {
    ProxyClass::Mobile
}

fn default_max_tokens() -> u32 {
    8000
}

fn default_temperature() -> f32 {
    0.1
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            default_model: default_model(),
            function_model: default_model(),
            models: default_models(),
            proxy_preference: default_proxy_preference(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl RouterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Request counters since start or the last `reset_stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retries_triggered: u64,
    pub route_switches: u64,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    route_switches: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> RouterStats {
        RouterStats {
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: self.successful.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            retries_triggered: self.retries.load(Ordering::Relaxed),
            route_switches: self.route_switches.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.total,
            &self.successful,
            &self.failed,
            &self.retries,
            &self.route_switches,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Result of one send: an HTTP response, a transport failure, or cancellation.
enum Sent {
    Response { status: u16, body: String },
    Transport { class: TransportClass, detail: String },
    Cancelled,
}

/// Masked credential and route of the most recent attempt, for debug strings.
#[derive(Default)]
struct Trace {
    key: Option<String>,
    route: Option<String>,
}

/// Routes completion requests across the credential and proxy pools.
///
/// Shared by handle (`Arc`); all mutable state sits behind the pools' locks
/// or atomics, so concurrent requests only serialize on selection.
pub struct RequestRouter {
    credentials: Arc<CredentialPool>,
    proxies: Arc<ProxyPool>,
    config: RouterConfig,
    current_model: RwLock<String>,
    preference: RwLock<ProxyClass>,
    auto_routing: AtomicBool,
    counters: Counters,
    /// One client per egress path, keyed by proxy URL or `direct`
    clients: StdMutex<HashMap<String, reqwest::Client>>,
}

impl RequestRouter {
    pub fn new(
        credentials: Arc<CredentialPool>,
        proxies: Arc<ProxyPool>,
        mut config: RouterConfig,
    ) -> Self {
        if !config.models.contains(&config.default_model) {
            config.models.push(config.default_model.clone());
        }
        info!(
            base_url = %config.base_url,
            model = %config.default_model,
            max_retries = config.max_retries,
            proxy_preference = %config.proxy_preference,
            "request router initialized"
        );
        Self {
            credentials,
            proxies,
            current_model: RwLock::new(config.default_model.clone()),
            preference: RwLock::new(config.proxy_preference),
            auto_routing: AtomicBool::new(true),
            counters: Counters::default(),
            clients: StdMutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialPool> {
        &self.credentials
    }

    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    /// Send `payload` to `{base_url}/{endpoint}` with retries.
    ///
    /// A `model` field is added to object payloads that lack one. Always
    /// returns a [`Dispatch`]; failures are carried in its outcome.
    pub async fn make_request(
        &self,
        endpoint: &str,
        mut payload: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Dispatch {
        let start = Instant::now();
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let model = self.current_model().await;
        ensure_model(&mut payload, &model);
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        );

        let mut preference = *self.preference.read().await;
        let mut trace = Trace::default();
        let max_retries = self.config.max_retries;

        for attempt in 0..=max_retries {
            let attempts = attempt + 1;
            let last_attempt = attempt == max_retries;

            if cancel.is_cancelled() {
                return self.finish(RequestOutcome::Cancelled, attempt, start, &trace);
            }

            let credential = match self.credentials.next().await {
                Ok(credential) => credential,
                Err(e) => {
                    warn!(error = %e, attempt = attempts, "no usable credential");
                    let outcome = RequestOutcome::ApiError {
                        status: None,
                        body: "no credentials".to_string(),
                    };
                    return self.finish(outcome, attempt, start, &trace);
                }
            };
            let route = self.proxies.get_with_fallback(preference).await;
            trace.key = Some(credential.masked());
            trace.route = Some(route.describe());

            debug!(
                attempt = attempts,
                credential = %credential.label,
                route = %route.describe(),
                "sending request"
            );

            match self.send(&url, &payload, &credential, &route, cancel).await {
                Sent::Cancelled => {
                    return self.finish(RequestOutcome::Cancelled, attempts, start, &trace);
                }

                Sent::Response { status, body } => match classify_response(status, &body) {
                    ResponseClass::Success => match serde_json::from_str(&body) {
                        Ok(json) => {
                            self.credentials.mark_success(&credential.label).await;
                            return self.finish(
                                RequestOutcome::Success(json),
                                attempts,
                                start,
                                &trace,
                            );
                        }
                        Err(e) => {
                            let outcome = RequestOutcome::ApiError {
                                status: Some(status),
                                body: format!("invalid JSON response: {e}"),
                            };
                            if last_attempt {
                                return self.finish(outcome, attempts, start, &trace);
                            }
                            self.note_retry("invalid_response", attempts);
                        }
                    },

                    ResponseClass::RateLimited => {
                        self.credentials
                            .mark_error(&credential.label, FailureKind::RateLimited)
                            .await;
                        if last_attempt {
                            return self.finish(RequestOutcome::RateLimited, attempts, start, &trace);
                        }
                        self.note_retry("rate_limit", attempts);
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            attempt = attempts,
                            max_attempts = max_retries + 1,
                            delay_ms = delay.as_millis() as u64,
                            "rate limited, backing off"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return self.finish(RequestOutcome::Cancelled, attempts, start, &trace);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }

                    ResponseClass::ContextTooLarge => {
                        return self.finish(
                            RequestOutcome::ContextTooLarge(body),
                            attempts,
                            start,
                            &trace,
                        );
                    }

                    ResponseClass::Error => {
                        self.credentials
                            .mark_error(&credential.label, FailureKind::Http(status))
                            .await;
                        if last_attempt {
                            let outcome = RequestOutcome::ApiError {
                                status: Some(status),
                                body,
                            };
                            return self.finish(outcome, attempts, start, &trace);
                        }
                        warn!(attempt = attempts, status, "upstream error, retrying");
                        self.note_retry("api_error", attempts);
                    }
                },

                Sent::Transport {
                    class: TransportClass::Proxy,
                    detail,
                } => {
                    if let Some(endpoint) = &route.endpoint {
                        self.proxies.mark_failure(endpoint, &detail).await;
                    }
                    self.proxies.force_rotate(route.class).await;
                    // A fallback route may already sit below the preference
                    let downgraded = preference.downgrade().lowest(route.class.downgrade());
                    self.counters.route_switches.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("llm_route_switches_total").increment(1);
                    warn!(
                        attempt = attempts,
                        route = %route.describe(),
                        from = %preference,
                        to = %downgraded,
                        error = %detail,
                        "proxy failure, downgrading egress class"
                    );
                    preference = downgraded;
                    if last_attempt {
                        return self.finish(
                            RequestOutcome::ProxyError(detail),
                            attempts,
                            start,
                            &trace,
                        );
                    }
                    self.note_retry("proxy_error", attempts);
                }

                Sent::Transport { class, detail } => {
                    if last_attempt {
                        let outcome =
                            RequestOutcome::NetworkError(format!("max retries exceeded: {detail}"));
                        return self.finish(outcome, attempts, start, &trace);
                    }
                    let reason = if class == TransportClass::Timeout {
                        "timeout"
                    } else {
                        "network_error"
                    };
                    warn!(attempt = attempts, error = %detail, reason, "request failed, retrying");
                    self.note_retry(reason, attempts);
                }
            }
        }

        self.finish(
            RequestOutcome::NetworkError("max retries exceeded".to_string()),
            max_retries + 1,
            start,
            &trace,
        )
    }

    /// Chat completion over `messages`. Unset options use the router defaults.
    pub async fn chat_completion(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        cancel: &CancellationToken,
    ) -> Dispatch {
        let model = match &options.model {
            Some(model) => model.clone(),
            None => self.current_model().await,
        };
        let payload = ChatRequest::new(
            &model,
            messages,
            options.max_tokens.unwrap_or(self.config.max_tokens),
            options.temperature.unwrap_or(self.config.temperature),
            options.tools.as_deref(),
        )
        .to_value();
        self.make_request("chat/completions", payload, cancel).await
    }

    /// Chat completion offering `tools`, on the function-calling model unless
    /// `model` is given.
    pub async fn function_call_completion(
        &self,
        messages: &[Message],
        tools: Vec<serde_json::Value>,
        model: Option<&str>,
        cancel: &CancellationToken,
    ) -> Dispatch {
        let options = ChatOptions::default()
            .model(model.unwrap_or(&self.config.function_model))
            .temperature(self.config.temperature)
            .tools(tools);
        self.chat_completion(messages, &options, cancel).await
    }

    /// Models `set_model` accepts.
    pub fn models(&self) -> &[String] {
        &self.config.models
    }

    pub async fn current_model(&self) -> String {
        self.current_model.read().await.clone()
    }

    /// Switch the default model. Unknown models are rejected.
    pub async fn set_model(&self, model: &str) -> Result<()> {
        if !self.config.models.iter().any(|m| m == model) {
            return Err(Error::UnknownModel(model.to_string()));
        }
        *self.current_model.write().await = model.to_string();
        info!(model, "default model changed");
        Ok(())
    }

    pub async fn proxy_preference(&self) -> ProxyClass {
        *self.preference.read().await
    }

    pub async fn set_proxy_preference(&self, class: ProxyClass) {
        *self.preference.write().await = class;
        info!(class = %class, "proxy preference changed");
    }

    /// Pin a credential and an egress class.
    pub async fn enable_manual_routing(&self, credential: &str, class: ProxyClass) -> Result<()> {
        self.credentials.enable_manual_override(credential).await?;
        *self.preference.write().await = class;
        self.auto_routing.store(false, Ordering::Relaxed);
        info!(credential, class = %class, "manual routing enabled");
        Ok(())
    }

    /// Return to automatic credential rotation. The proxy preference is kept.
    pub async fn enable_auto_routing(&self) {
        self.credentials.disable_manual_override().await;
        self.auto_routing.store(true, Ordering::Relaxed);
        info!("automatic routing enabled");
    }

    pub fn auto_routing(&self) -> bool {
        self.auto_routing.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RouterStats {
        self.counters.snapshot()
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
        info!("router statistics reset");
    }

    /// Router, credential pool and proxy pool state.
    pub async fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "current_model": self.current_model().await,
            "available_models": self.config.models,
            "preferred_proxy": self.proxy_preference().await,
            "auto_routing": self.auto_routing(),
            "request_stats": self.stats(),
            "credentials": self.credentials.health().await,
            "proxies": self.proxies.status().await,
        })
    }

    /// 429 backoff before attempt `attempt + 1`: `min(base * 2^attempt, cap)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = self.config.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.config.backoff_cap_ms))
    }

    async fn send(
        &self,
        url: &str,
        payload: &serde_json::Value,
        credential: &SelectedCredential,
        route: &ProxyRoute,
        cancel: &CancellationToken,
    ) -> Sent {
        let client = match self.client_for(route) {
            Ok(client) => client,
            Err(e) => {
                let class = if route.is_direct() {
                    TransportClass::Network
                } else {
                    TransportClass::Proxy
                };
                return Sent::Transport {
                    class,
                    detail: format!("failed to build client: {}", e.without_url()),
                };
            }
        };

        let request = client
            .post(url)
            .bearer_auth(credential.key.expose())
            .timeout(self.config.timeout())
            .json(payload);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Sent::Cancelled,
            response = request.send() => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return Sent::Transport {
                    class: classify_transport(&e, !route.is_direct()),
                    detail: transport_detail(e),
                };
            }
        };

        let status = response.status().as_u16();
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Sent::Cancelled,
            body = response.text() => body,
        };
        match body {
            Ok(body) => Sent::Response { status, body },
            // The response arrived, so the proxy did its job
            Err(e) => Sent::Transport {
                class: classify_transport(&e, false),
                detail: transport_detail(e),
            },
        }
    }

    /// Cached client for an egress path. Direct clients ignore proxy env vars.
    fn client_for(&self, route: &ProxyRoute) -> reqwest::Result<reqwest::Client> {
        let key = route
            .endpoint
            .as_ref()
            .map(|ep| ep.url().to_string())
            .unwrap_or_else(|| "direct".to_string());

        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let builder = reqwest::Client::builder();
        let builder = match &route.endpoint {
            Some(endpoint) => builder.proxy(reqwest::Proxy::all(endpoint.url())?),
            None => builder.no_proxy(),
        };
        let client = builder.build()?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    fn note_retry(&self, reason: &'static str, attempt: u32) {
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("llm_retries_total", "reason" => reason).increment(1);
        debug!(attempt, reason, "retry scheduled");
    }

    fn finish(
        &self,
        outcome: RequestOutcome,
        attempts: u32,
        start: Instant,
        trace: &Trace,
    ) -> Dispatch {
        let elapsed = start.elapsed();
        let status = outcome.status();
        let debug = format!(
            "{status} after {attempts} attempt(s) in {:.2}s, key {}, proxy {}",
            elapsed.as_secs_f64(),
            trace.key.as_deref().unwrap_or("none"),
            trace.route.as_deref().unwrap_or("none"),
        );

        let summary = debug.as_str();
        if status == RequestStatus::Success {
            self.counters.successful.fetch_add(1, Ordering::Relaxed);
            info!(
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                summary = %summary,
                "request succeeded"
            );
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                status = %status,
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                summary = %summary,
                "request failed"
            );
        }
        metrics::counter!("llm_requests_total", "status" => status.as_str()).increment(1);
        metrics::histogram!("llm_request_duration_seconds", "status" => status.as_str())
            .record(elapsed.as_secs_f64());

        Dispatch {
            outcome,
            debug,
            attempts,
            elapsed,
        }
    }
}

/// Failure detail without the request URL.
fn transport_detail(error: reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        format!("connection failed: {}", error.without_url())
    } else {
        error.without_url().to_string()
    }
}
