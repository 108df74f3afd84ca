//! Token accounting against model context limits

use std::collections::HashMap;

use common::{Message, Role};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chunk::{self, ContextChunk, ContextStrategy};
use crate::tokens::TokenCounter;

/// Fixed per-message framing cost added on top of role and content tokens.
pub const MESSAGE_OVERHEAD: usize = 3;

/// Budgeter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    /// Tokens held back for the model's response
    #[serde(default = "default_response_reserve")]
    pub response_reserve: usize,

    /// Context limit for models missing from `model_limits`
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// `cl100k_base`, `o200k_base` or `heuristic`
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,

    /// Context limit per model name
    #[serde(default = "default_model_limits")]
    pub model_limits: HashMap<String, usize>,
}

fn default_response_reserve() -> usize {
    1000
}

fn default_limit() -> usize {
    8000
}

fn default_tokenizer() -> String {
    "cl100k_base".to_string()
}

/// Conservative limits for the hosted models the gateway targets.
fn default_model_limits() -> HashMap<String, usize> {
    [
        "llama-3.3-70b-versatile",
        "llama-3.1-70b-versatile",
        "llama-3.1-8b-instant",
        "llama3-groq-70b-8192-tool-use-preview",
        "llama3-groq-8b-8192-tool-use-preview",
    ]
    .into_iter()
    .map(|model| (model.to_string(), 8000))
    .collect()
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            response_reserve: default_response_reserve(),
            default_limit: default_limit(),
            tokenizer: default_tokenizer(),
            model_limits: default_model_limits(),
        }
    }
}

/// Result of [`ContextBudgeter::prepare`].
///
/// `fits == true` means `messages` can be sent as one request and `chunks` is
/// `None`. Otherwise `messages` is empty and `chunks` holds the split content.
#[derive(Debug, Clone, Serialize)]
pub struct Prepared {
    pub fits: bool,
    pub messages: Vec<Message>,
    pub chunks: Option<Vec<ContextChunk>>,
}

/// Context usage summary for a conversation against one model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextStats {
    pub total_tokens: usize,
    pub effective_limit: usize,
    pub fits: bool,
    pub utilization_percent: f64,
    pub tokens_over_limit: usize,
    pub message_count: usize,
    pub average_tokens_per_message: f64,
}

/// Decides whether a conversation fits a model, and compresses or chunks it
/// when it does not.
#[derive(Debug, Clone)]
pub struct ContextBudgeter {
    counter: TokenCounter,
    config: BudgetConfig,
}

impl ContextBudgeter {
    /// Build a budgeter using the tokenizer named in `config`.
    pub fn new(config: BudgetConfig) -> Self {
        let counter = TokenCounter::from_name(&config.tokenizer);
        info!(
            tokenizer = counter.name(),
            response_reserve = config.response_reserve,
            default_limit = config.default_limit,
            models = config.model_limits.len(),
            "context budgeter initialized"
        );
        Self { counter, config }
    }

    /// Build a budgeter with an explicit counter, ignoring `config.tokenizer`.
    pub fn with_counter(counter: TokenCounter, config: BudgetConfig) -> Self {
        Self { counter, config }
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    /// Cost of a single message: role + content + framing overhead.
    fn message_cost(&self, message: &Message) -> usize {
        self.count_tokens(message.role.as_str())
            + self.count_tokens(&message.content)
            + MESSAGE_OVERHEAD
    }

    pub fn count_message_tokens(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.message_cost(m)).sum()
    }

    /// Context limit for `model`, or the default for unknown models.
    pub fn model_limit(&self, model: &str) -> usize {
        self.config
            .model_limits
            .get(model)
            .copied()
            .unwrap_or(self.config.default_limit)
    }

    /// Model limit minus the response reserve.
    pub fn effective_limit(&self, model: &str) -> usize {
        self.model_limit(model)
            .saturating_sub(self.config.response_reserve)
    }

    pub fn fits(&self, messages: &[Message], model: &str) -> bool {
        self.count_message_tokens(messages) <= self.effective_limit(model)
    }

    /// Drop older turns until the conversation fits `target_tokens`.
    ///
    /// A leading system message is always kept verbatim. The most recent
    /// non-system messages are then taken from the end backwards, stopping at
    /// the first one that would exceed the target. Order is preserved.
    /// Conversations that already fit are returned unchanged.
    pub fn compress(&self, messages: &[Message], target_tokens: usize) -> Vec<Message> {
        if self.count_message_tokens(messages) <= target_tokens {
            return messages.to_vec();
        }

        let (system, rest) = match messages.split_first() {
            Some((first, rest)) if first.role == Role::System => (Some(first), rest),
            _ => (None, messages),
        };

        let mut used = system.map(|m| self.message_cost(m)).unwrap_or(0);
        let mut kept: Vec<&Message> = Vec::new();
        for message in rest.iter().rev().filter(|m| m.role != Role::System) {
            let cost = self.message_cost(message);
            if used + cost > target_tokens {
                break;
            }
            used += cost;
            kept.push(message);
        }

        debug!(
            original = messages.len(),
            kept = kept.len() + usize::from(system.is_some()),
            tokens = used,
            target_tokens,
            "compressed conversation"
        );

        system
            .into_iter()
            .chain(kept.into_iter().rev())
            .cloned()
            .collect()
    }

    /// Split `text` into chunks of at most `max_tokens` tokens.
    pub fn chunk(
        &self,
        text: &str,
        max_tokens: usize,
        strategy: ContextStrategy,
    ) -> Vec<ContextChunk> {
        chunk::chunk_text(&self.counter, text, max_tokens, strategy)
    }

    /// Decide how to send `messages` to `model`.
    ///
    /// 1. Fits → original messages, no chunks
    /// 2. Compressed form fits and still carries at least one non-system
    ///    message → compressed messages, no chunks
    /// 3. Otherwise the whole conversation is flattened to `**Role:** content`
    ///    blocks and chunked at the effective limit
    pub fn prepare(
        &self,
        messages: &[Message],
        model: &str,
        strategy: ContextStrategy,
    ) -> Prepared {
        let limit = self.effective_limit(model);
        if self.fits(messages, model) {
            return Prepared {
                fits: true,
                messages: messages.to_vec(),
                chunks: None,
            };
        }

        let compressed = self.compress(messages, limit);
        let has_turns = compressed.iter().any(|m| m.role != Role::System);
        if has_turns && self.count_message_tokens(&compressed) <= limit {
            info!(
                model,
                original = messages.len(),
                compressed = compressed.len(),
                "conversation compressed to fit context"
            );
            return Prepared {
                fits: true,
                messages: compressed,
                chunks: None,
            };
        }

        let combined = messages
            .iter()
            .map(|m| format!("**{}:** {}", m.role.title(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = self.chunk(&combined, limit, strategy);
        info!(
            model,
            strategy = %strategy,
            chunks = chunks.len(),
            effective_limit = limit,
            "conversation exceeds context, chunking"
        );
        Prepared {
            fits: false,
            messages: Vec::new(),
            chunks: Some(chunks),
        }
    }

    pub fn context_stats(&self, messages: &[Message], model: &str) -> ContextStats {
        let total_tokens = self.count_message_tokens(messages);
        let effective_limit = self.effective_limit(model);
        let utilization_percent = if effective_limit == 0 {
            0.0
        } else {
            total_tokens as f64 / effective_limit as f64 * 100.0
        };
        let average_tokens_per_message = if messages.is_empty() {
            0.0
        } else {
            total_tokens as f64 / messages.len() as f64
        };
        ContextStats {
            total_tokens,
            effective_limit,
            fits: total_tokens <= effective_limit,
            utilization_percent,
            tokens_over_limit: total_tokens.saturating_sub(effective_limit),
            message_count: messages.len(),
            average_tokens_per_message,
        }
    }

    /// Message list for processing one chunk on its own.
    pub fn chunk_messages(
        &self,
        chunk: &ContextChunk,
        system_prompt: Option<&str>,
    ) -> Vec<Message> {
        let mut header = format!("Processing chunk {} of {}", chunk.index + 1, chunk.total);
        if chunk.total > 1 {
            let strategy = chunk
                .metadata
                .get("strategy")
                .map(String::as_str)
                .unwrap_or("unknown");
            header.push_str(&format!(" (Strategy: {strategy})"));
        }

        let mut messages = Vec::with_capacity(2);
        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
            messages.push(Message::system(prompt));
        }
        messages.push(Message::user(format!("{header}\n\n{}", chunk.content)));
        messages
    }
}

impl Default for ContextBudgeter {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}
