//! Ollama provider.
//!
//! Calls a local Ollama instance: `/api/chat` for chat, `/api/generate`
//! with an `images` array for vision. Separate models are used for the
//! two paths (`ollama_model`, `ollama_vision_model`).

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::Options;

use super::{backoff_delay, LlmProvider, LlmReply, ToolCall, VisionAnalysis};

pub struct OllamaProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    vision_model: String,
    max_retries: u32,
}

impl OllamaProvider {
    pub fn new(options: &Options) -> Result<Self> {
        // Vision generations are slow on CPU hosts; double the configured timeout.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.llm_timeout_secs * 2))
            .build()?;

        Ok(Self {
            client,
            url: options.ollama_url.trim_end_matches('/').to_string(),
            model: options.ollama_model.clone(),
            vision_model: options.ollama_vision_model.clone(),
            max_retries: options.llm_max_retries,
        })
    }

    async fn request(&self, path: &str, payload: &Value) -> Result<Value> {
        let url = format!("{}{}", self.url, path);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let resp = self.client.post(&url).json(payload).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();

                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err =
                            Some(anyhow::anyhow!("Ollama API error {}: {}", status, body_text));
                        continue;
                    }

                    bail!("Ollama API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url,
                        e
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Ollama request failed after retries")))
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn chat(&self, messages: &[Value], tools: Option<&[Value]>) -> Result<LlmReply> {
        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });
        if let Some(tools) = tools {
            payload["tools"] = json!(tools);
        }

        let data = self.request("/api/chat", &payload).await?;

        let message = data.get("message").cloned().unwrap_or(Value::Null);
        let text = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();

        let tool_calls = message
            .get("tool_calls")
            .and_then(|t| t.as_array())
            .map(|calls| {
                calls
                    .iter()
                    .map(|call| {
                        // Ollama nests the call under "function"; tolerate flat too.
                        let func = call.get("function").unwrap_or(call);
                        ToolCall {
                            id: String::new(),
                            name: func
                                .get("name")
                                .and_then(|n| n.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            input: func.get("arguments").cloned().unwrap_or(Value::Null),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(LlmReply { text, tool_calls })
    }

    async fn vision(&self, image: &[u8], prompt: &str) -> Result<VisionAnalysis> {
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(image);

        let payload = json!({
            "model": self.vision_model,
            "prompt": prompt,
            "images": [image_b64],
            "stream": false,
        });

        let data = self.request("/api/generate", &payload).await?;

        let description = data
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string();

        // Ollama reports no confidence; non-empty output counts as confident.
        let confidence = if description.is_empty() { 0.0 } else { 1.0 };

        Ok(VisionAnalysis {
            description,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_is_normalized() {
        let mut opts = Options::default();
        opts.ollama_url = "http://ollama.local:11434/".to_string();
        let provider = OllamaProvider::new(&opts).unwrap();
        assert_eq!(provider.url, "http://ollama.local:11434");
    }

    #[test]
    fn test_default_models() {
        let provider = OllamaProvider::new(&Options::default()).unwrap();
        assert_eq!(provider.model, "llama3");
        assert_eq!(provider.vision_model, "llava");
    }
}
