use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Add-on options, read from `/data/options.json`.
///
/// Every key is optional in the file; defaults match the documented add-on
/// schema so a missing or empty options file yields a usable configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Options {
    #[serde(default = "default_llm_provider")]
    pub llm_provider: String,
    #[serde(default)]
    pub claude_proxy_url: String,
    #[serde(default)]
    pub claude_proxy_key: String,
    #[serde(default)]
    pub claude_fallback_url: String,
    #[serde(default)]
    pub claude_fallback_key: String,
    #[serde(default = "default_claude_model")]
    pub claude_model: String,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,
    #[serde(default = "default_ollama_vision_model")]
    pub ollama_vision_model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub llm_max_retries: u32,
    #[serde(default)]
    pub yandex_api_key: String,
    #[serde(default)]
    pub yandex_folder_id: String,
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval: u64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub custom_prompt: String,
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,
    #[serde(default = "default_ota_port")]
    pub ota_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Address the device should use to reach the vision endpoint. When unset
    /// the bridge falls back to the host the device used for its OTA check-in.
    #[serde(default)]
    pub host_ip: Option<String>,
    /// SenseCraft Agent MCP broker URL (`wss://...`). Unset disables the bridge.
    #[serde(default)]
    pub sensecraft_mcp_url: Option<String>,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,
}

fn default_llm_provider() -> String {
    "claude".to_string()
}
fn default_claude_model() -> String {
    "claude-3-5-sonnet-20240620".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "llama3".to_string()
}
fn default_ollama_vision_model() -> String {
    "llava".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    30
}
fn default_llm_max_retries() -> u32 {
    3
}
fn default_monitoring_interval() -> u64 {
    60
}
fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_websocket_port() -> u16 {
    8000
}
fn default_ota_port() -> u16 {
    8001
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_snapshot_dir() -> String {
    "/share/watcher/snapshots".to_string()
}

impl Default for Options {
    fn default() -> Self {
        // A missing options file deserializes every field to its default.
        serde_json::from_str("{}").expect("empty options object must deserialize")
    }
}

/// Load and validate add-on options.
///
/// A missing file is not an error — the Supervisor always writes one, but the
/// bridge must also run outside an add-on container with plain defaults.
pub fn load_options(path: &Path) -> Result<Options> {
    let options: Options = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read options file: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| "Failed to parse options file")?
    } else {
        Options::default()
    };

    match options.llm_provider.as_str() {
        "claude" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown llm_provider: '{}'. Must be claude or ollama.",
            other
        ),
    }

    if options.llm_provider == "claude"
        && (options.claude_proxy_url.is_empty() || options.claude_proxy_key.is_empty())
        && (options.claude_fallback_url.is_empty() || options.claude_fallback_key.is_empty())
    {
        anyhow::bail!(
            "llm_provider is 'claude' but neither claude_proxy_url/claude_proxy_key \
             nor claude_fallback_url/claude_fallback_key is configured"
        );
    }

    if !(0.0..=1.0).contains(&options.confidence_threshold) {
        anyhow::bail!("confidence_threshold must be in [0.0, 1.0]");
    }

    if options.monitoring_interval == 0 {
        anyhow::bail!("monitoring_interval must be >= 1 second");
    }

    if options.websocket_port == 0 || options.ota_port == 0 {
        anyhow::bail!("websocket_port and ota_port must be nonzero");
    }

    if options.websocket_port == options.ota_port {
        anyhow::bail!("websocket_port and ota_port must differ");
    }

    Ok(options)
}

/// MQTT connection parameters resolved at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "core-mosquitto".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl MqttSettings {
    /// Resolve broker parameters: Supervisor service discovery first, then
    /// environment variables, then the add-on defaults. Failures at any step
    /// fall through to the next; startup never blocks on broker discovery.
    pub async fn resolve() -> Self {
        if let Ok(token) = std::env::var("SUPERVISOR_TOKEN") {
            if !token.is_empty() {
                match crate::supervisor::fetch_mqtt_service(&token).await {
                    Ok(settings) => {
                        tracing::info!(
                            host = %settings.host,
                            port = settings.port,
                            user = %settings.username,
                            "MQTT credentials fetched from Supervisor"
                        );
                        return settings;
                    }
                    Err(e) => {
                        tracing::warn!("Supervisor MQTT discovery failed: {e:#}");
                    }
                }
            }
        } else {
            tracing::warn!("SUPERVISOR_TOKEN not set, skipping Supervisor MQTT discovery");
        }

        Self::from_env()
    }

    /// Read broker parameters from the environment, defaulting where unset.
    ///
    /// Older bootstrap scripts exported the password as `MQTT_PASS`; both
    /// names are accepted, `MQTT_PASSWORD` wins.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let host = match std::env::var("MQTT_HOST") {
            Ok(h) if !h.is_empty() => h,
            _ => defaults.host,
        };

        let port = std::env::var("MQTT_PORT")
            .ok()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .unwrap_or(defaults.port);

        let username = std::env::var("MQTT_USER").unwrap_or_default();
        let password = std::env::var("MQTT_PASSWORD")
            .or_else(|_| std::env::var("MQTT_PASS"))
            .unwrap_or_default();

        Self {
            host,
            port,
            username,
            password,
        }
    }
}

/// Mask a secret for logs: first three characters, then `***`.
pub fn mask(val: &str) -> String {
    if val.is_empty() {
        return String::new();
    }
    if val.len() <= 3 {
        return "***".to_string();
    }
    format!("{}***", &val[..3])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::default();
        assert_eq!(opts.llm_provider, "claude");
        assert_eq!(opts.monitoring_interval, 60);
        assert_eq!(opts.websocket_port, 8000);
        assert_eq!(opts.ota_port, 8001);
        assert!((opts.confidence_threshold - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask(""), "");
        assert_eq!(mask("ab"), "***");
        assert_eq!(mask("secret-key"), "sec***");
    }

    #[test]
    fn test_mqtt_defaults() {
        let settings = MqttSettings::default();
        assert_eq!(settings.host, "core-mosquitto");
        assert_eq!(settings.port, 1883);
        assert!(settings.username.is_empty());
    }
}
