//! Claude-compatible provider.
//!
//! Talks to a hosted Claude proxy (and an optional fallback endpoint) using
//! the Anthropic Messages wire format: `x-api-key` header, pinned
//! `anthropic-version`, content blocks in, content blocks out.

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::Options;

use super::{backoff_delay, parse_vision_text, LlmProvider, LlmReply, ToolCall, VisionAnalysis};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct ClaudeProvider {
    client: reqwest::Client,
    model: String,
    /// `(url, api_key)` pairs in priority order: proxy first, fallback second.
    endpoints: Vec<(String, String)>,
    max_retries: u32,
}

impl ClaudeProvider {
    pub fn new(options: &Options) -> Result<Self> {
        let mut endpoints = Vec::new();
        if !options.claude_proxy_url.is_empty() && !options.claude_proxy_key.is_empty() {
            endpoints.push((
                options.claude_proxy_url.clone(),
                options.claude_proxy_key.clone(),
            ));
        }
        if !options.claude_fallback_url.is_empty() && !options.claude_fallback_key.is_empty() {
            endpoints.push((
                options.claude_fallback_url.clone(),
                options.claude_fallback_key.clone(),
            ));
        }
        if endpoints.is_empty() {
            bail!("Claude provider requires claude_proxy_url/key or claude_fallback_url/key");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.llm_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            model: options.claude_model.clone(),
            endpoints,
            max_retries: options.llm_max_retries,
        })
    }

    /// POST the payload, rotating through endpoints within each attempt.
    ///
    /// A non-429 client error aborts immediately — the request itself is bad
    /// and no endpoint or retry will fix it. Everything else (rate limit,
    /// server error, network failure) moves to the next endpoint, then backs
    /// off and retries the whole rotation.
    async fn request(&self, payload: &Value) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            for (url, api_key) in &self.endpoints {
                let resp = self
                    .client
                    .post(url)
                    .header("x-api-key", api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .header("Content-Type", "application/json")
                    .json(payload)
                    .send()
                    .await;

                match resp {
                    Ok(response) => {
                        let status = response.status();

                        if status.is_success() {
                            return Ok(response.json().await?);
                        }

                        let body_text = response.text().await.unwrap_or_default();

                        if status.as_u16() == 429 || status.is_server_error() {
                            tracing::warn!("Claude endpoint {url} returned {status}, trying next");
                            last_err =
                                Some(anyhow::anyhow!("Claude API error {}: {}", status, body_text));
                            continue;
                        }

                        bail!("Claude API error {}: {}", status, body_text);
                    }
                    Err(e) => {
                        tracing::warn!("Claude endpoint {url} unreachable: {e}");
                        last_err = Some(e.into());
                        continue;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Claude request failed after retries")))
    }

    /// Concatenate `text` blocks and collect `tool_use` blocks.
    fn parse_content(data: &Value) -> LlmReply {
        let mut reply = LlmReply::default();

        if let Some(content) = data.get("content").and_then(|c| c.as_array()) {
            for block in content {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            reply.text.push_str(text);
                        }
                    }
                    Some("tool_use") => {
                        reply.tool_calls.push(ToolCall {
                            id: block
                                .get("id")
                                .and_then(|i| i.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            name: block
                                .get("name")
                                .and_then(|n| n.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            input: block.get("input").cloned().unwrap_or(Value::Null),
                        });
                    }
                    _ => {}
                }
            }
        }

        reply
    }
}

#[async_trait]
impl LlmProvider for ClaudeProvider {
    fn name(&self) -> &str {
        "claude"
    }

    async fn chat(&self, messages: &[Value], tools: Option<&[Value]>) -> Result<LlmReply> {
        let mut payload = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": messages,
        });
        if let Some(tools) = tools {
            payload["tools"] = json!(tools);
        }

        let data = self.request(&payload).await?;
        Ok(Self::parse_content(&data))
    }

    async fn vision(&self, image: &[u8], prompt: &str) -> Result<VisionAnalysis> {
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(image);

        let messages = [json!({
            "role": "user",
            "content": [
                {
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": "image/jpeg",
                        "data": image_b64,
                    },
                },
                {"type": "text", "text": prompt},
            ],
        })];

        let payload = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": messages,
        });

        let data = self.request(&payload).await?;
        Ok(parse_vision_text(&Self::parse_content(&data).text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claude_options() -> Options {
        let mut opts = Options::default();
        opts.claude_proxy_url = "http://proxy.local/v1/messages".to_string();
        opts.claude_proxy_key = "sk-proxy".to_string();
        opts.claude_fallback_url = "http://fallback.local/v1/messages".to_string();
        opts.claude_fallback_key = "sk-fallback".to_string();
        opts
    }

    #[test]
    fn test_endpoint_priority() {
        let provider = ClaudeProvider::new(&claude_options()).unwrap();
        assert_eq!(provider.endpoints.len(), 2);
        assert_eq!(provider.endpoints[0].0, "http://proxy.local/v1/messages");
        assert_eq!(provider.endpoints[1].0, "http://fallback.local/v1/messages");
    }

    #[test]
    fn test_incomplete_pairs_are_skipped() {
        let mut opts = claude_options();
        opts.claude_proxy_key.clear();
        let provider = ClaudeProvider::new(&opts).unwrap();
        assert_eq!(provider.endpoints.len(), 1);
        assert_eq!(provider.endpoints[0].0, "http://fallback.local/v1/messages");
    }

    #[test]
    fn test_no_endpoints_is_an_error() {
        let opts = Options::default();
        assert!(ClaudeProvider::new(&opts).is_err());
    }

    #[test]
    fn test_parse_content_blocks() {
        let data = json!({
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "text", "text": "world"},
                {"type": "tool_use", "id": "tu_1", "name": "get_weather",
                 "input": {"entity_id": "weather.home"}},
            ]
        });
        let reply = ClaudeProvider::parse_content(&data);
        assert_eq!(reply.text, "Hello world");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "get_weather");
        assert_eq!(reply.tool_calls[0].input["entity_id"], "weather.home");
    }

    #[test]
    fn test_parse_content_empty() {
        let reply = ClaudeProvider::parse_content(&json!({"content": []}));
        assert!(reply.text.is_empty());
        assert!(reply.tool_calls.is_empty());
    }
}
