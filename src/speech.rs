//! Yandex SpeechKit speech-to-text and text-to-speech.
//!
//! Both directions are best-effort: a missing API key or folder id logs a
//! warning and yields an empty result, so voice features degrade to no-ops
//! instead of failing the bridge.

use anyhow::Result;
use std::time::Duration;

use crate::config::Options;

const STT_URL: &str = "https://stt.api.cloud.yandex.net/speech/v1/stt:recognize";
const TTS_URL: &str = "https://tts.api.cloud.yandex.net/speech/v1/tts:synthesize";

pub struct SpeechKit {
    client: reqwest::Client,
    api_key: String,
    folder_id: String,
}

impl SpeechKit {
    pub fn new(options: &Options) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_key: options.yandex_api_key.clone(),
            folder_id: options.yandex_folder_id.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.folder_id.is_empty()
    }

    /// Recognize speech from raw audio. Returns an empty string when
    /// unconfigured or on any API failure.
    pub async fn recognize(&self, audio: Vec<u8>) -> String {
        if !self.is_configured() {
            tracing::warn!("Yandex STT: API key or folder id missing");
            return String::new();
        }

        let result = self
            .client
            .post(STT_URL)
            .header("Authorization", format!("Api-Key {}", self.api_key))
            .query(&[("folderId", self.folder_id.as_str()), ("lang", "ru-RU")])
            .body(audio)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    tracing::error!("Yandex STT HTTP error: {status} - {body}");
                    return String::new();
                }
                match response.json::<serde_json::Value>().await {
                    Ok(json) => json
                        .get("result")
                        .and_then(|r| r.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    Err(e) => {
                        tracing::error!("Yandex STT response error: {e}");
                        String::new()
                    }
                }
            }
            Err(e) => {
                tracing::error!("Yandex STT error: {e}");
                String::new()
            }
        }
    }

    /// Synthesize `text` to OggOpus audio. Returns empty bytes when
    /// unconfigured or on any API failure.
    pub async fn synthesize(&self, text: &str) -> Vec<u8> {
        if !self.is_configured() {
            tracing::warn!("Yandex TTS: API key or folder id missing");
            return Vec::new();
        }

        let form = [
            ("text", text),
            ("lang", "ru-RU"),
            ("voice", "alena"),
            ("folderId", self.folder_id.as_str()),
            ("format", "oggopus"),
        ];

        let result = self
            .client
            .post(TTS_URL)
            .header("Authorization", format!("Api-Key {}", self.api_key))
            .form(&form)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    tracing::error!("Yandex TTS HTTP error: {status} - {body}");
                    return Vec::new();
                }
                match response.bytes().await {
                    Ok(bytes) => bytes.to_vec(),
                    Err(e) => {
                        tracing::error!("Yandex TTS body error: {e}");
                        Vec::new()
                    }
                }
            }
            Err(e) => {
                tracing::error!("Yandex TTS error: {e}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_by_default() {
        let speech = SpeechKit::new(&Options::default()).unwrap();
        assert!(!speech.is_configured());
    }

    #[tokio::test]
    async fn test_unconfigured_recognize_is_empty() {
        let speech = SpeechKit::new(&Options::default()).unwrap();
        assert_eq!(speech.recognize(vec![0u8; 64]).await, "");
    }

    #[tokio::test]
    async fn test_unconfigured_synthesize_is_empty() {
        let speech = SpeechKit::new(&Options::default()).unwrap();
        assert!(speech.synthesize("привет").await.is_empty());
    }
}
