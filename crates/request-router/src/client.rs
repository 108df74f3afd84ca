//! Context-aware client over [`RequestRouter`]
//!
//! Budgets each conversation before it is sent: fitting conversations go
//! straight through, oversized ones are compressed, and content that cannot
//! be compressed is processed chunk by chunk.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::Message;
use context_budget::{ContextBudgeter, ContextStrategy};
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::outcome::{Dispatch, RequestOutcome, RequestStatus};
use crate::payload::ChatOptions;
use crate::router::RequestRouter;

/// Client behaviour, usually deserialized from the `[client]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Response token budget for `chat`
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Retry once with a compressed conversation when upstream rejects it as too large
    #[serde(default = "default_auto_retry")]
    pub auto_retry: bool,

    /// Attempts per chunk in `process_large_content`
    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,

    /// Base delay between chunk attempts; attempt `n` waits `n * delay`
    #[serde(default = "default_chunk_retry_delay_ms")]
    pub chunk_retry_delay_ms: u64,

    /// Tokens kept free below the effective limit when chunking content
    #[serde(default = "default_chunk_reserve")]
    pub chunk_reserve: usize,
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_temperature() -> f32 {
    0.1
}

fn default_auto_retry() -> bool {
    true
}

fn default_max_chunk_retries() -> u32 {
    3
}

fn default_chunk_retry_delay_ms() -> u64 {
    1000
}

fn default_chunk_reserve() -> usize {
    500
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            auto_retry: default_auto_retry(),
            max_chunk_retries: default_max_chunk_retries(),
            chunk_retry_delay_ms: default_chunk_retry_delay_ms(),
            chunk_reserve: default_chunk_reserve(),
        }
    }
}

/// Result for one chunk of `process_large_content`.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    /// Zero-based chunk position
    pub index: usize,
    pub total: usize,
    /// Attempts made for this chunk
    pub attempts: u32,
    pub dispatch: Dispatch,
}

/// Counters since creation or the last `reset_session_stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub requests: u64,
    pub successful: u64,
    pub chunks_processed: u64,
    pub auto_retries: u64,
}

#[derive(Default)]
struct SessionCounters {
    requests: AtomicU64,
    successful: AtomicU64,
    chunks_processed: AtomicU64,
    auto_retries: AtomicU64,
}

pub struct LlmClient {
    router: Arc<RequestRouter>,
    budgeter: Arc<ContextBudgeter>,
    config: ClientConfig,
    session: SessionCounters,
}

impl LlmClient {
    pub fn new(
        router: Arc<RequestRouter>,
        budgeter: Arc<ContextBudgeter>,
        config: ClientConfig,
    ) -> Self {
        Self {
            router,
            budgeter,
            config,
            session: SessionCounters::default(),
        }
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn budgeter(&self) -> &Arc<ContextBudgeter> {
        &self.budgeter
    }

    /// Run token counting work on the blocking pool so long inputs do not
    /// stall the async workers.
    pub async fn with_budgeter<T, F>(&self, work: F) -> Result<T, JoinError>
    where
        F: FnOnce(&ContextBudgeter) -> T + Send + 'static,
        T: Send + 'static,
    {
        let budgeter = Arc::clone(&self.budgeter);
        tokio::task::spawn_blocking(move || work(&budgeter)).await
    }

    /// Chat completion with context management.
    ///
    /// Conversations that still exceed the limit after compression are not
    /// sent; they need `process_large_content`.
    pub async fn chat(
        &self,
        messages: &[Message],
        model: Option<&str>,
        cancel: &CancellationToken,
    ) -> Dispatch {
        let model = self.resolve_model(model).await;
        self.session.requests.fetch_add(1, Ordering::Relaxed);

        let owned = messages.to_vec();
        let budget_model = model.clone();
        let prepared = match self
            .with_budgeter(move |b| b.prepare(&owned, &budget_model, ContextStrategy::default()))
            .await
        {
            Ok(prepared) => prepared,
            Err(e) => return budgeting_failed(e),
        };
        if !prepared.fits {
            let chunks = prepared.chunks.map_or(0, |c| c.len());
            warn!(model = %model, chunks, "conversation too large to send");
            return Dispatch::local(
                RequestOutcome::ContextTooLarge(format!(
                    "conversation exceeds the context of {model} and needs {chunks} chunks"
                )),
                "context too large for single request; use chunked processing",
            );
        }

        let options = ChatOptions::default()
            .model(model.as_str())
            .max_tokens(self.config.default_max_tokens)
            .temperature(self.config.temperature);
        let mut dispatch = self
            .router
            .chat_completion(&prepared.messages, &options, cancel)
            .await;

        if dispatch.status() == RequestStatus::ContextTooLarge && self.config.auto_retry {
            let target = self.budgeter.effective_limit(&model) / 2;
            let sent = prepared.messages.clone();
            let compressed = match self.with_budgeter(move |b| b.compress(&sent, target)).await {
                Ok(compressed) => compressed,
                Err(e) => return budgeting_failed(e),
            };
            self.session.auto_retries.fetch_add(1, Ordering::Relaxed);
            info!(
                model = %model,
                target_tokens = target,
                kept = compressed.len(),
                "upstream rejected context size, retrying compressed"
            );
            dispatch = self
                .router
                .chat_completion(&compressed, &options, cancel)
                .await;
            dispatch.debug.push_str(" (auto-compressed)");
        }

        if dispatch.is_success() {
            self.session.successful.fetch_add(1, Ordering::Relaxed);
        }
        dispatch
    }

    /// Tool-calling completion. The conversation must fit the context as is.
    pub async fn function_call(
        &self,
        messages: &[Message],
        tools: Vec<serde_json::Value>,
        model: Option<&str>,
        cancel: &CancellationToken,
    ) -> Dispatch {
        self.session.requests.fetch_add(1, Ordering::Relaxed);
        let check_model = match model {
            Some(model) => model.to_string(),
            None => self.router.config().function_model.clone(),
        };

        let owned = messages.to_vec();
        let budget_model = check_model.clone();
        let stats = match self
            .with_budgeter(move |b| b.context_stats(&owned, &budget_model))
            .await
        {
            Ok(stats) => stats,
            Err(e) => return budgeting_failed(e),
        };
        if !stats.fits {
            return Dispatch::local(
                RequestOutcome::ContextTooLarge(format!(
                    "{} tokens over the limit of {}",
                    stats.tokens_over_limit, stats.effective_limit
                )),
                "context too large for function calling",
            );
        }

        let dispatch = self
            .router
            .function_call_completion(messages, tools, Some(&check_model), cancel)
            .await;
        if dispatch.is_success() {
            self.session.successful.fetch_add(1, Ordering::Relaxed);
        }
        dispatch
    }

    /// Split `content` into chunks below the model's limit and send each one.
    ///
    /// Each chunk gets up to `max_chunk_retries` attempts. Oversized chunks
    /// are not retried. Cancellation stops processing after the current chunk.
    pub async fn process_large_content(
        &self,
        content: &str,
        system_prompt: Option<&str>,
        model: Option<&str>,
        strategy: ContextStrategy,
        cancel: &CancellationToken,
    ) -> Vec<ChunkResult> {
        let model = self.resolve_model(model).await;
        let limit = self
            .budgeter
            .effective_limit(&model)
            .saturating_sub(self.config.chunk_reserve)
            .max(1);
        let owned = content.to_string();
        let chunks = match self
            .with_budgeter(move |b| b.chunk(&owned, limit, strategy))
            .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                error!(error = %e, "chunking failed");
                return Vec::new();
            }
        };
        info!(
            model = %model,
            chunks = chunks.len(),
            chunk_limit = limit,
            strategy = %strategy,
            "processing large content"
        );

        let options = ChatOptions::default()
            .model(model.as_str())
            .max_tokens(self.config.default_max_tokens)
            .temperature(self.config.temperature);
        let max_attempts = self.config.max_chunk_retries.max(1);
        let mut results = Vec::with_capacity(chunks.len());

        for chunk in &chunks {
            let messages = self.budgeter.chunk_messages(chunk, system_prompt);
            let mut attempts = 0;
            let dispatch = loop {
                attempts += 1;
                self.session.requests.fetch_add(1, Ordering::Relaxed);
                let dispatch = self.router.chat_completion(&messages, &options, cancel).await;
                let terminal = matches!(
                    dispatch.status(),
                    RequestStatus::Success | RequestStatus::ContextTooLarge | RequestStatus::Cancelled
                );
                if terminal || attempts >= max_attempts {
                    break dispatch;
                }

                let delay = Duration::from_millis(self.config.chunk_retry_delay_ms * u64::from(attempts));
                warn!(
                    chunk = chunk.index + 1,
                    total = chunk.total,
                    attempt = attempts,
                    status = %dispatch.status(),
                    delay_ms = delay.as_millis() as u64,
                    "chunk failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break dispatch,
                    _ = tokio::time::sleep(delay) => {}
                }
            };

            self.session.chunks_processed.fetch_add(1, Ordering::Relaxed);
            if dispatch.is_success() {
                self.session.successful.fetch_add(1, Ordering::Relaxed);
            }
            results.push(ChunkResult {
                index: chunk.index,
                total: chunk.total,
                attempts,
                dispatch,
            });
            if cancel.is_cancelled() {
                warn!(
                    processed = results.len(),
                    total = chunks.len(),
                    "chunk processing cancelled"
                );
                break;
            }
        }
        results
    }

    pub fn session_stats(&self) -> SessionStats {
        SessionStats {
            requests: self.session.requests.load(Ordering::Relaxed),
            successful: self.session.successful.load(Ordering::Relaxed),
            chunks_processed: self.session.chunks_processed.load(Ordering::Relaxed),
            auto_retries: self.session.auto_retries.load(Ordering::Relaxed),
        }
    }

    pub fn reset_session_stats(&self) {
        self.session.requests.store(0, Ordering::Relaxed);
        self.session.successful.store(0, Ordering::Relaxed);
        self.session.chunks_processed.store(0, Ordering::Relaxed);
        self.session.auto_retries.store(0, Ordering::Relaxed);
    }

    async fn resolve_model(&self, model: Option<&str>) -> String {
        match model {
            Some(model) => model.to_string(),
            None => self.router.current_model().await,
        }
    }
}

fn budgeting_failed(e: JoinError) -> Dispatch {
    error!(error = %e, "context budgeting failed");
    Dispatch::local(
        RequestOutcome::ApiError {
            status: None,
            body: format!("context budgeting failed: {e}"),
        },
        "context budgeting failed",
    )
}
