//! Chat completion request bodies

use common::Message;
use serde::Serialize;

/// Per-call overrides for a chat completion.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Model name; the router's current model when `None`
    pub model: Option<String>,
    /// Response token budget; the router's default when `None`
    pub max_tokens: Option<u32>,
    /// Sampling temperature; the router's default when `None`
    pub temperature: Option<f32>,
    /// Tool definitions. When present, `tool_choice` is `auto`.
    pub tools: Option<Vec<serde_json::Value>>,
}

impl ChatOptions {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// Body of `POST /chat/completions`.
#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<&'a [serde_json::Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<&'static str>,
}

impl<'a> ChatRequest<'a> {
    pub fn new(
        model: &'a str,
        messages: &'a [Message],
        max_tokens: u32,
        temperature: f32,
        tools: Option<&'a [serde_json::Value]>,
    ) -> Self {
        let tools = tools.filter(|t| !t.is_empty());
        Self {
            model,
            messages,
            max_tokens,
            temperature,
            tool_choice: tools.map(|_| "auto"),
            tools,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Insert `model` into a JSON object body that does not name one.
pub(crate) fn ensure_model(payload: &mut serde_json::Value, model: &str) {
    if let Some(object) = payload.as_object_mut() {
        object
            .entry("model")
            .or_insert_with(|| serde_json::Value::String(model.to_string()));
    }
}
