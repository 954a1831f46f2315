// QuectoFlow — LLM completion service abstraction

pub mod factory;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: String,
    pub finish_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageInfo {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// A text completion service. Implementations are shared read-only across
/// concurrent workflow runs.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        model: &str,
        options: &HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<LLMResponse>;

    fn default_model(&self) -> &str;
}

/// Stand-in used when no provider could be configured. Every call fails with
/// the configuration error, so workflows without `llm_call` steps still run.
pub struct Unavailable {
    reason: String,
}

impl Unavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LLMProvider for Unavailable {
    async fn chat(
        &self,
        _messages: &[Message],
        _model: &str,
        _options: &HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<LLMResponse> {
        anyhow::bail!("LLM provider unavailable: {}", self.reason)
    }

    fn default_model(&self) -> &str {
        ""
    }
}

/// Run a single prompt/system-prompt exchange.
///
/// Returns the assistant text together with the full message history, which
/// callers keep for diagnostics. On failure the history sent so far is
/// returned alongside the error.
pub async fn complete(
    provider: &dyn LLMProvider,
    prompt: &str,
    system_prompt: &str,
) -> Result<(String, Vec<Message>), (anyhow::Error, Vec<Message>)> {
    let mut messages = vec![Message::system(system_prompt), Message::user(prompt)];
    match provider
        .chat(&messages, provider.default_model(), &HashMap::new())
        .await
    {
        Ok(response) => {
            messages.push(Message::assistant(response.content.clone()));
            Ok((response.content, messages))
        }
        Err(e) => Err((e, messages)),
    }
}
