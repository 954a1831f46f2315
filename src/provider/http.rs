// QuectoFlow — HTTP-based LLM provider (OpenAI-compatible)

use super::*;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

/// HTTPProvider speaks the OpenAI-compatible chat completions API.
/// Works with OpenAI, OpenRouter, Groq, vLLM and similar endpoints.
pub struct HTTPProvider {
    api_key: String,
    api_base: String,
    client: Client,
    model: String,
    timeout: Duration,
    max_retries: usize,
    retry_delay_ms: u64,
}

impl HTTPProvider {
    pub fn new(
        api_key: String,
        api_base: String,
        proxy: Option<&str>,
        model: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30));

        if let Some(proxy_url) = proxy {
            if !proxy_url.is_empty() {
                builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
            }
        }

        let base = if api_base.is_empty() {
            // Default API bases by key prefix
            if api_key.starts_with("sk-or-") {
                "https://openrouter.ai/api/v1".to_string()
            } else if api_key.starts_with("gsk_") {
                "https://api.groq.com/openai/v1".to_string()
            } else {
                "https://api.openai.com/v1".to_string()
            }
        } else {
            api_base
        };

        Ok(Self {
            api_key,
            api_base: base,
            client: builder.build()?,
            model,
            timeout,
            max_retries: 3,
            retry_delay_ms: 1000,
        })
    }

    /// Override the retry budget used when no per-call options are given.
    pub fn with_retries(mut self, max_retries: usize, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Per-request timeout of the underlying HTTP client.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl LLMProvider for HTTPProvider {
    async fn chat(
        &self,
        messages: &[Message],
        model: &str,
        options: &HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<LLMResponse> {
        let use_model = if model.is_empty() { &self.model } else { model };
        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));

        let max_retries = options
            .get("max_retries")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(self.max_retries);
        let retry_delay_ms = options
            .get("retry_delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.retry_delay_ms);

        let mut body = json!({
            "model": use_model,
            "messages": messages,
        });

        if let Some(obj) = body.as_object_mut() {
            for (k, v) in options {
                // Retry settings are client-side only
                if k != "max_retries" && k != "retry_delay_ms" {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }

        let mut last_error = None;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                tracing::info!(
                    attempt = attempt,
                    "Retrying LLM request after {}ms delay",
                    retry_delay_ms
                );
                tokio::time::sleep(Duration::from_millis(retry_delay_ms)).await;
            }

            tracing::debug!(
                url = %url,
                model = %use_model,
                attempt = attempt,
                timeout_secs = self.timeout.as_secs(),
                "Sending LLM request"
            );

            let res = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match res {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let response_body = response.text().await?;
                        tracing::debug!(status = %status, body_len = response_body.len(), "LLM response received");
                        return parse_response(&response_body);
                    }

                    let is_transient = status.is_server_error() || status.as_u16() == 429;
                    let response_body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "could not read body".to_string());

                    if is_transient && attempt < max_retries {
                        tracing::warn!(status = %status, attempt = attempt, "Transient LLM API error: {}", response_body);
                        last_error = Some(anyhow::anyhow!(
                            "LLM API error ({}): {}",
                            status,
                            response_body
                        ));
                        continue;
                    } else {
                        anyhow::bail!("LLM API error ({}): {}", status, response_body);
                    }
                }
                Err(e) if attempt < max_retries => {
                    tracing::warn!(error = %e, attempt = attempt, "Network error during LLM request");
                    last_error = Some(anyhow::Error::from(e));
                    continue;
                }
                Err(e) => return Err(anyhow::Error::from(e)),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            anyhow::anyhow!("LLM request failed after {} attempts", max_retries + 1)
        }))
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

/// Parse an OpenAI-compatible chat completion response.
fn parse_response(body: &str) -> anyhow::Result<LLMResponse> {
    let v: serde_json::Value = serde_json::from_str(body)?;

    if let Some(err) = v.get("error") {
        let msg = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        anyhow::bail!("LLM API error: {}", msg);
    }

    let choice = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| anyhow::anyhow!("No choices in LLM response"))?;

    let message = choice
        .get("message")
        .ok_or_else(|| anyhow::anyhow!("No message in choice"))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|f| f.as_str())
        .unwrap_or("stop")
        .to_string();

    let usage = v.get("usage").map(|u| UsageInfo {
        prompt_tokens: u.get("prompt_tokens").and_then(|n| n.as_u64()).unwrap_or(0) as usize,
        completion_tokens: u
            .get("completion_tokens")
            .and_then(|n| n.as_u64())
            .unwrap_or(0) as usize,
        total_tokens: u.get("total_tokens").and_then(|n| n.as_u64()).unwrap_or(0) as usize,
    });

    Ok(LLMResponse {
        content,
        finish_reason,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_response() {
        let json = r#"{
            "choices": [{
                "message": {"role": "assistant", "content": "{\"a\": \"1\"}"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;

        let resp = parse_response(json).unwrap();
        assert_eq!(resp.content, "{\"a\": \"1\"}");
        assert_eq!(resp.finish_reason, "stop");
        assert_eq!(resp.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_parse_null_content() {
        let json = r#"{"choices": [{"message": {"role": "assistant", "content": null}}]}"#;
        let resp = parse_response(json).unwrap();
        assert_eq!(resp.content, "");
        assert_eq!(resp.finish_reason, "stop");
    }

    #[test]
    fn test_parse_error_response() {
        let json = r#"{"error": {"message": "Invalid API key", "type": "auth_error"}}"#;
        let result = parse_response(json);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid API key"));
    }

    #[test]
    fn test_parse_no_choices() {
        let result = parse_response(r#"{"choices": []}"#);
        assert!(result.unwrap_err().to_string().contains("No choices"));
    }

    #[test]
    fn test_default_base_from_key_prefix() {
        let p = HTTPProvider::new(
            "gsk_abc".into(),
            String::new(),
            None,
            "llama".into(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(p.api_base, "https://api.groq.com/openai/v1");
        assert_eq!(p.default_model(), "llama");
    }
}
