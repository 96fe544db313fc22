//! Home Assistant Supervisor service discovery.
//!
//! Add-on containers receive a `SUPERVISOR_TOKEN` and may query the
//! Supervisor's internal HTTP API for service credentials. The only service
//! this bridge needs is MQTT:
//!
//! ```text
//! GET http://supervisor/services/mqtt
//! Authorization: Bearer <SUPERVISOR_TOKEN>
//!
//! {"data": {"host": "core-mosquitto", "port": 1883,
//!           "username": "addons", "password": "..."}}
//! ```
//!
//! Discovery is best-effort: any failure (missing token, unreachable
//! Supervisor, malformed JSON) is reported to the caller, which falls back
//! to environment variables and static defaults.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::config::MqttSettings;

const SUPERVISOR_MQTT_URL: &str = "http://supervisor/services/mqtt";

/// Fetch MQTT broker parameters from the Supervisor API.
pub async fn fetch_mqtt_service(token: &str) -> Result<MqttSettings> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let response = client
        .get(SUPERVISOR_MQTT_URL)
        .header("Authorization", format!("Bearer {}", token))
        .send()
        .await
        .context("Supervisor API unreachable")?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("Supervisor API returned {}", status);
    }

    let json: serde_json::Value = response
        .json()
        .await
        .context("Invalid JSON from Supervisor API")?;

    parse_mqtt_service(&json)
}

/// Extract `data.{host,port,username,password}` from a Supervisor response.
///
/// Missing fields take the broker defaults rather than failing — the
/// Supervisor omits credentials when the broker runs unauthenticated.
pub fn parse_mqtt_service(json: &serde_json::Value) -> Result<MqttSettings> {
    let data = json
        .get("data")
        .and_then(|d| d.as_object())
        .ok_or_else(|| anyhow::anyhow!("Supervisor response missing data object"))?;

    let defaults = MqttSettings::default();

    let host = data
        .get("host")
        .and_then(|h| h.as_str())
        .unwrap_or(&defaults.host)
        .to_string();

    let port = data
        .get("port")
        .and_then(|p| p.as_u64())
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(defaults.port);

    let username = data
        .get("username")
        .and_then(|u| u.as_str())
        .unwrap_or_default()
        .to_string();

    let password = data
        .get("password")
        .and_then(|p| p.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(MqttSettings {
        host,
        port,
        username,
        password,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_response() {
        let json = json!({
            "data": {
                "host": "core-mosquitto",
                "port": 1883,
                "username": "addons",
                "password": "hunter2"
            }
        });
        let settings = parse_mqtt_service(&json).unwrap();
        assert_eq!(settings.host, "core-mosquitto");
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.username, "addons");
        assert_eq!(settings.password, "hunter2");
    }

    #[test]
    fn test_parse_missing_credentials() {
        let json = json!({"data": {"host": "broker.local", "port": 8883}});
        let settings = parse_mqtt_service(&json).unwrap();
        assert_eq!(settings.host, "broker.local");
        assert_eq!(settings.port, 8883);
        assert!(settings.username.is_empty());
        assert!(settings.password.is_empty());
    }

    #[test]
    fn test_parse_missing_data() {
        let json = json!({"result": "error"});
        assert!(parse_mqtt_service(&json).is_err());
    }

    #[test]
    fn test_parse_port_out_of_range() {
        let json = json!({"data": {"host": "broker", "port": 70000}});
        let settings = parse_mqtt_service(&json).unwrap();
        assert_eq!(settings.port, 1883);
    }
}
