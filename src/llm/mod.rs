//! LLM provider abstraction and implementations.
//!
//! Defines the [`LlmProvider`] trait and concrete implementations:
//! - **[`claude::ClaudeProvider`]** — calls a Claude-compatible proxy, with
//!   an optional fallback endpoint tried when the primary fails.
//! - **[`ollama::OllamaProvider`]** — calls a local Ollama instance's
//!   `/api/chat` and `/api/generate` endpoints.
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to instantiate the provider named by
//! `llm_provider` in the add-on options.
//!
//! # Retry Strategy
//!
//! Both providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! The Claude provider additionally rotates through its configured
//! endpoints (proxy, then fallback) within each attempt.

pub mod claude;
pub mod ollama;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::Options;

/// A tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Reply from a chat completion.
#[derive(Debug, Clone, Default)]
pub struct LlmReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Result of a vision analysis.
#[derive(Debug, Clone)]
pub struct VisionAnalysis {
    pub description: String,
    /// Model-reported confidence in `[0.0, 1.0]`. Providers that do not
    /// report confidence use fixed values (see each implementation).
    pub confidence: f64,
}

/// Trait for LLM backends.
///
/// Messages and tool definitions are passed as raw JSON values in the
/// provider's native wire shape — the bridge composes them per provider and
/// has no use for an intermediate chat model.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Returns the provider name (`"claude"`, `"ollama"`).
    fn name(&self) -> &str;

    /// Send a chat request, optionally with tool definitions.
    async fn chat(&self, messages: &[Value], tools: Option<&[Value]>) -> Result<LlmReply>;

    /// Describe a JPEG image according to `prompt`.
    async fn vision(&self, image: &[u8], prompt: &str) -> Result<VisionAnalysis>;
}

/// Create the [`LlmProvider`] named by the options.
///
/// # Errors
///
/// Returns an error for unknown provider names or if the provider cannot
/// be initialized (missing endpoint configuration).
pub fn create_provider(options: &Options) -> Result<Box<dyn LlmProvider>> {
    match options.llm_provider.as_str() {
        "claude" => Ok(Box::new(claude::ClaudeProvider::new(options)?)),
        "ollama" => Ok(Box::new(ollama::OllamaProvider::new(options)?)),
        other => bail!("Unknown llm_provider: {}", other),
    }
}

/// Extract an embedded `{"description": ..., "confidence": ...}` object from
/// a vision reply.
///
/// The analysis prompt asks the model to answer in JSON, but models routinely
/// wrap the object in prose or markdown fences. The first `{` to the last `}`
/// is tried as JSON; anything unparsable falls back to the raw text with
/// confidence 0.5.
pub(crate) fn parse_vision_text(text: &str) -> VisionAnalysis {
    let start = text.find('{');
    let end = text.rfind('}');

    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                let description = value
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or(text)
                    .to_string();
                let confidence = value
                    .get("confidence")
                    .and_then(|c| c.as_f64())
                    .unwrap_or(0.5);
                return VisionAnalysis {
                    description,
                    confidence,
                };
            }
        }
    }

    VisionAnalysis {
        description: text.to_string(),
        confidence: 0.5,
    }
}

/// Delay before retry `attempt` (1-based): 1s, 2s, 4s, ... capped at 32s.
pub(crate) fn backoff_delay(attempt: u32) -> std::time::Duration {
    std::time::Duration::from_secs(1 << attempt.saturating_sub(1).min(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_with_provider(provider: &str) -> Options {
        let mut opts = Options::default();
        opts.llm_provider = provider.to_string();
        opts.claude_proxy_url = "http://proxy.local/v1/messages".to_string();
        opts.claude_proxy_key = "sk-test".to_string();
        opts
    }

    #[test]
    fn test_factory_selects_claude() {
        let provider = create_provider(&options_with_provider("claude")).unwrap();
        assert_eq!(provider.name(), "claude");
    }

    #[test]
    fn test_factory_selects_ollama() {
        let provider = create_provider(&options_with_provider("ollama")).unwrap();
        assert_eq!(provider.name(), "ollama");
    }

    #[test]
    fn test_factory_rejects_unknown() {
        assert!(create_provider(&options_with_provider("palm")).is_err());
    }

    #[test]
    fn test_parse_vision_json() {
        let analysis =
            parse_vision_text(r#"{"description": "a cat on the porch", "confidence": 0.92}"#);
        assert_eq!(analysis.description, "a cat on the porch");
        assert!((analysis.confidence - 0.92).abs() < 1e-9);
    }

    #[test]
    fn test_parse_vision_json_embedded_in_prose() {
        let analysis = parse_vision_text(
            "Here is my analysis:\n{\"description\": \"empty driveway\", \"confidence\": 0.4}\nLet me know.",
        );
        assert_eq!(analysis.description, "empty driveway");
        assert!((analysis.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_parse_vision_plain_text() {
        let analysis = parse_vision_text("I can see a delivery van.");
        assert_eq!(analysis.description, "I can see a delivery van.");
        assert!((analysis.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(1).as_secs(), 1);
        assert_eq!(backoff_delay(3).as_secs(), 4);
        assert_eq!(backoff_delay(10).as_secs(), 32);
    }
}
