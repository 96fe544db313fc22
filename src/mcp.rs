//! SenseCraft MCP bridge.
//!
//! The SenseCraft Agent cloud drives Home Assistant through this add-on: the
//! broker connects as an MCP *client*, so the bridge dials out over TLS
//! WebSocket and then answers JSON-RPC as the *server* — `initialize`,
//! `tools/list`, `tools/call`, `ping`. Tool calls are executed against the
//! Home Assistant core API.
//!
//! The connection is kept alive with periodic pings and re-dialed every ten
//! seconds after any failure, forever.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

use crate::ha_api::{tool_definitions, HaClient};

const RECONNECT_DELAY: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PROTOCOL_VERSION: &str = "2024-11-05";

pub struct SenseCraftMcp {
    url: String,
    ha: Arc<HaClient>,
}

impl SenseCraftMcp {
    pub fn new(url: String, ha: Arc<HaClient>) -> Self {
        Self { url, ha }
    }

    /// Connect-and-serve loop. Never returns; the orchestrator aborts the
    /// task on shutdown.
    pub async fn run(self) {
        loop {
            if let Err(e) = self.connect_once().await {
                tracing::error!("SenseCraft MCP error: {e:#}");
            }
            tracing::info!("Reconnecting to SenseCraft MCP in {}s", RECONNECT_DELAY.as_secs());
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn connect_once(&self) -> Result<()> {
        tracing::info!("Connecting to SenseCraft MCP broker");
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .context("SenseCraft MCP broker unreachable")?;
        tracing::info!("Connected to SenseCraft MCP broker");

        let (mut sink, mut stream) = ws.split();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    sink.send(Message::Ping(Vec::new().into())).await?;
                }
                incoming = stream.next() => {
                    let Some(message) = incoming else {
                        anyhow::bail!("broker closed the connection");
                    };
                    match message? {
                        Message::Text(raw) => {
                            if let Some(response) = self.handle_message(raw.as_str()).await {
                                sink.send(Message::text(response.to_string())).await?;
                            }
                        }
                        Message::Close(_) => anyhow::bail!("broker sent close"),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Process one JSON-RPC message; `Some` is the response to send back.
    async fn handle_message(&self, raw: &str) -> Option<Value> {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(_) => {
                tracing::warn!("Invalid JSON from broker: {}", truncate(raw, 200));
                return None;
            }
        };

        let id = msg.get("id").cloned().unwrap_or(Value::Null);

        match msg.get("method").and_then(|m| m.as_str()) {
            Some("initialize") => {
                let client_info = msg.pointer("/params/clientInfo").cloned().unwrap_or(Value::Null);
                tracing::info!("MCP initialize from: {}", client_info);
                Some(initialize_response(id))
            }
            Some("notifications/initialized") => {
                tracing::info!("SenseCraft MCP handshake complete");
                None
            }
            Some("tools/list") => Some(tools_list_response(id)),
            Some("tools/call") => {
                let params = msg.get("params").cloned().unwrap_or(json!({}));
                Some(self.call_tool(id, &params).await)
            }
            Some("ping") => Some(json!({"jsonrpc": "2.0", "id": id, "result": {}})),
            Some(other) => {
                tracing::debug!("Unknown MCP method: {other}");
                None
            }
            // Responses to our own traffic carry no method; ignore.
            None => None,
        }
    }

    async fn call_tool(&self, id: Value, params: &Value) -> Value {
        let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        tracing::info!("SenseCraft tool call: {name}");

        match self.ha.execute(name, &arguments).await {
            Ok(result) => {
                let text = result.to_string();
                tracing::info!("Tool {name} result: {}", truncate(&text, 200));
                tool_result_response(id, &text, false)
            }
            Err(e) => {
                tracing::error!("Tool {name} failed: {e:#}");
                tool_result_response(id, &format!("Error: {e}"), true)
            }
        }
    }
}

fn initialize_response(id: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {
                "name": "sensecap-ha-addon",
                "version": env!("CARGO_PKG_VERSION"),
            },
        },
    })
}

fn tools_list_response(id: Value) -> Value {
    let tools: Vec<Value> = tool_definitions()
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "inputSchema": t.input_schema,
            })
        })
        .collect();
    json!({"jsonrpc": "2.0", "id": id, "result": {"tools": tools}})
}

fn tool_result_response(id: Value, text: &str, is_error: bool) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "content": [{"type": "text", "text": text}],
            "isError": is_error,
        },
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_response_shape() {
        let resp = initialize_response(json!(1));
        assert_eq!(resp["jsonrpc"], "2.0");
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(resp["result"]["serverInfo"]["name"], "sensecap-ha-addon");
    }

    #[test]
    fn test_tools_list_matches_definitions() {
        let resp = tools_list_response(json!(2));
        let tools = resp["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), tool_definitions().len());
        assert!(tools.iter().all(|t| t["inputSchema"].is_object()));
    }

    #[test]
    fn test_tool_result_response() {
        let ok = tool_result_response(json!(3), "{\"state\": \"on\"}", false);
        assert_eq!(ok["result"]["isError"], false);
        assert_eq!(ok["result"]["content"][0]["type"], "text");

        let err = tool_result_response(json!(4), "Error: boom", true);
        assert_eq!(err["result"]["isError"], true);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("привет", 3), "при");
        assert_eq!(truncate("short", 200), "short");
    }
}
