//! Home Assistant core REST API client and the tool set exposed to agents.
//!
//! The Supervisor proxies the core API at `http://supervisor/core/api`,
//! authenticated with the same `SUPERVISOR_TOKEN` the add-on already holds.
//! Six tools are defined here (states, services, weather, notifications,
//! calendar, media control); the SenseCraft MCP bridge advertises them with
//! their JSON input schemas and dispatches calls through [`HaClient::execute`].

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::time::Duration;

const CORE_API_BASE: &str = "http://supervisor/core/api";

/// A tool definition: name, description, and JSON Schema for its input.
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// The tools this add-on offers to LLM agents.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "get_states",
            description: "Get current states of Home Assistant entities",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "entity_ids": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "List of entity IDs to query",
                    }
                },
                "required": ["entity_ids"],
            }),
        },
        ToolDefinition {
            name: "call_service",
            description: "Call a Home Assistant service",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "domain": {
                        "type": "string",
                        "description": "The service domain (e.g., light, switch)",
                    },
                    "service": {
                        "type": "string",
                        "description": "The service name (e.g., turn_on, toggle)",
                    },
                    "data": {"type": "object", "description": "Service data parameters"},
                },
                "required": ["domain", "service", "data"],
            }),
        },
        ToolDefinition {
            name: "get_weather",
            description: "Get current weather information from a weather entity",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "entity_id": {
                        "type": "string",
                        "description": "The weather entity ID (e.g., weather.home)",
                    }
                },
                "required": ["entity_id"],
            }),
        },
        ToolDefinition {
            name: "send_notification",
            description: "Send a persistent notification to Home Assistant",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The notification message content",
                    },
                    "title": {
                        "type": "string",
                        "description": "Optional notification title",
                    },
                },
                "required": ["message"],
            }),
        },
        ToolDefinition {
            name: "get_calendar",
            description: "Get events from a Home Assistant calendar entity",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "entity_id": {
                        "type": "string",
                        "description": "The calendar entity ID",
                    },
                    "days": {
                        "type": "integer",
                        "description": "Number of days ahead to fetch events",
                        "default": 7,
                    },
                },
                "required": ["entity_id"],
            }),
        },
        ToolDefinition {
            name: "control_media",
            description: "Control a media player entity",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "entity_id": {
                        "type": "string",
                        "description": "The media_player entity ID",
                    },
                    "action": {
                        "type": "string",
                        "enum": [
                            "media_play",
                            "media_pause",
                            "media_stop",
                            "media_next_track",
                            "media_previous_track",
                            "toggle",
                        ],
                        "description": "The action to perform",
                    },
                },
                "required": ["entity_id", "action"],
            }),
        },
    ]
}

/// Client for the Supervisor-proxied core REST API.
pub struct HaClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HaClient {
    pub fn new(token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: CORE_API_BASE.to_string(),
            token,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.token))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.token))
    }

    /// Dispatch a tool call by name. Unknown names are an error; individual
    /// entity failures inside `get_states` are reported per entity instead
    /// of failing the whole call.
    pub async fn execute(&self, tool_name: &str, args: &Value) -> Result<Value> {
        match tool_name {
            "get_states" => {
                let entity_ids = args
                    .get("entity_ids")
                    .and_then(|e| e.as_array())
                    .ok_or_else(|| anyhow::anyhow!("get_states requires entity_ids"))?;
                let ids: Vec<&str> = entity_ids.iter().filter_map(|v| v.as_str()).collect();
                Ok(json!(self.get_states(&ids).await))
            }
            "call_service" => {
                let domain = require_str(args, "domain")?;
                let service = require_str(args, "service")?;
                let data = args.get("data").cloned().unwrap_or(json!({}));
                self.call_service(domain, service, &data).await
            }
            "get_weather" => self.get_state(require_str(args, "entity_id")?).await,
            "send_notification" => {
                let message = require_str(args, "message")?;
                let title = args.get("title").and_then(|t| t.as_str());
                self.send_notification(message, title).await
            }
            "get_calendar" => self.get_calendar(require_str(args, "entity_id")?).await,
            "control_media" => {
                let entity_id = require_str(args, "entity_id")?;
                let action = require_str(args, "action")?;
                self.control_media(entity_id, action).await
            }
            other => bail!("Unknown tool: {}", other),
        }
    }

    pub async fn get_state(&self, entity_id: &str) -> Result<Value> {
        let response = self
            .get(&format!("/states/{}", entity_id))
            .send()
            .await
            .with_context(|| format!("Failed to fetch state for {}", entity_id))?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Fetch several entity states; failures become `{"entity_id", "error"}`
    /// placeholders so one bad id does not hide the rest.
    pub async fn get_states(&self, entity_ids: &[&str]) -> Vec<Value> {
        let mut states = Vec::with_capacity(entity_ids.len());
        for entity_id in entity_ids {
            match self.get_state(entity_id).await {
                Ok(state) => states.push(state),
                Err(e) => {
                    tracing::error!("Error fetching state for {entity_id}: {e:#}");
                    states.push(json!({"entity_id": entity_id, "error": e.to_string()}));
                }
            }
        }
        states
    }

    pub async fn call_service(&self, domain: &str, service: &str, data: &Value) -> Result<Value> {
        let response = self
            .post(&format!("/services/{}/{}", domain, service))
            .json(data)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn send_notification(&self, message: &str, title: Option<&str>) -> Result<Value> {
        let mut data = json!({"message": message});
        if let Some(title) = title {
            data["title"] = json!(title);
        }
        let response = self
            .post("/services/notify/persistent_notification")
            .json(&data)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn get_calendar(&self, entity_id: &str) -> Result<Value> {
        let response = self
            .get(&format!("/calendars/{}", entity_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn control_media(&self, entity_id: &str, action: &str) -> Result<Value> {
        let data = json!({"entity_id": entity_id});
        let response = self
            .post(&format!("/services/media_player/{}", action))
            .json(&data)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing required argument: {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_six_tools_defined() {
        let tools = tool_definitions();
        assert_eq!(tools.len(), 6);
        let names: Vec<&str> = tools.iter().map(|t| t.name).collect();
        assert!(names.contains(&"get_states"));
        assert!(names.contains(&"control_media"));
    }

    #[test]
    fn test_schemas_declare_required_fields() {
        for tool in tool_definitions() {
            assert_eq!(tool.input_schema["type"], "object", "{}", tool.name);
            assert!(
                tool.input_schema["required"].is_array(),
                "{} missing required list",
                tool.name
            );
        }
    }

    #[tokio::test]
    async fn test_execute_rejects_unknown_tool() {
        let client = HaClient::new("token".to_string()).unwrap();
        let err = client.execute("reboot_host", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_execute_validates_arguments() {
        let client = HaClient::new("token".to_string()).unwrap();
        let err = client.execute("get_weather", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("entity_id"));
    }
}
