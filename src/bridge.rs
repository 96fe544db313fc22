//! Bridge orchestrator.
//!
//! Wires every component together and owns the runtime state: the device
//! link, the latest camera frame, tunables that Home Assistant can change at
//! runtime, and the command/message routing between MQTT, the device
//! WebSocket, and the LLM backend.

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::config::{mask, MqttSettings, Options};
use crate::device::{self, DeviceLink, DeviceMessage};
use crate::display::{DisplayManager, DisplayMode};
use crate::entities;
use crate::ha_api::HaClient;
use crate::llm::{self, LlmProvider};
use crate::mcp::SenseCraftMcp;
use crate::monitoring::{Monitoring, DEFAULT_ANALYSIS_PROMPT};
use crate::mqtt::{self, Command, MqttSession};
use crate::speech::SpeechKit;
use crate::{ota, ws_server};

const RECONNECT_DELAY_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(60);

/// Settings Home Assistant may change at runtime through entity commands.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub custom_prompt: String,
    pub monitoring_interval: u64,
    pub confidence_threshold: f64,
}

pub struct Bridge {
    pub options: Options,
    pub tunables: RwLock<Tunables>,
    pub mqtt: MqttSession,
    pub device: Arc<DeviceLink>,
    pub display: DisplayManager,
    pub monitoring: Monitoring,
    pub llm: Box<dyn LlmProvider>,
    pub speech: SpeechKit,
    /// Most recent camera frame, fed by both the WebSocket image messages
    /// and the vision HTTP endpoint.
    last_frame: Mutex<Option<Vec<u8>>>,
    /// Host the device used for its OTA check-in; fallback for the vision URL.
    last_ota_host: Mutex<Option<String>>,
    rpc_id: AtomicU64,
    audio_frames: AtomicU64,
    reconnect_delay: Mutex<Duration>,
}

impl Bridge {
    pub fn new(options: Options, mqtt: MqttSession) -> Result<Arc<Self>> {
        let llm = llm::create_provider(&options)?;
        tracing::info!("LLM provider created: {}", llm.name());

        let speech = SpeechKit::new(&options)?;
        let device = Arc::new(DeviceLink::new());
        let display = DisplayManager::new(device.clone());
        let monitoring = Monitoring::new(options.snapshot_dir.clone());

        let tunables = Tunables {
            custom_prompt: options.custom_prompt.clone(),
            monitoring_interval: options.monitoring_interval,
            confidence_threshold: options.confidence_threshold,
        };

        Ok(Arc::new(Self {
            options,
            tunables: RwLock::new(tunables),
            mqtt,
            device,
            display,
            monitoring,
            llm,
            speech,
            last_frame: Mutex::new(None),
            last_ota_host: Mutex::new(None),
            rpc_id: AtomicU64::new(100),
            audio_frames: AtomicU64::new(0),
            reconnect_delay: Mutex::new(RECONNECT_DELAY_INITIAL),
        }))
    }

    pub fn next_rpc_id(&self) -> u64 {
        self.rpc_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Vision endpoint URL advertised to the device: explicit `host_ip`
    /// option, else the host from the last OTA check-in.
    pub fn vision_url(&self) -> String {
        let host = self
            .options
            .host_ip
            .clone()
            .or_else(|| self.last_ota_host.lock().expect("ota host lock").clone())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        format!("http://{}:{}/vision/explain", host, self.options.ota_port)
    }

    pub fn note_ota_host(&self, host: &str) {
        *self.last_ota_host.lock().expect("ota host lock") = Some(host.to_string());
    }

    pub fn analysis_prompt(&self) -> String {
        let tunables = self.tunables.read().expect("tunables lock");
        if tunables.custom_prompt.is_empty() {
            DEFAULT_ANALYSIS_PROMPT.to_string()
        } else {
            tunables.custom_prompt.clone()
        }
    }

    pub fn latest_frame(&self) -> Option<Vec<u8>> {
        self.last_frame.lock().expect("last frame lock").clone()
    }

    /// Store a camera frame and publish it to the image entity.
    pub async fn ingest_camera_frame(&self, frame: Vec<u8>) {
        if let Err(e) = self
            .mqtt
            .publish_raw(entities::SNAPSHOT_IMAGE_TOPIC, frame.clone(), true)
            .await
        {
            tracing::error!("Failed to publish camera frame: {e:#}");
        }
        *self.last_frame.lock().expect("last frame lock") = Some(frame);
    }

    // ==================== HA command routing ====================

    pub async fn handle_command(&self, cmd: Command) {
        if let Err(e) = self.dispatch_command(&cmd).await {
            tracing::error!(
                "Error handling HA command {}/{}: {e:#}",
                cmd.component,
                cmd.object_id
            );
        }
    }

    async fn dispatch_command(&self, cmd: &Command) -> Result<()> {
        let payload = cmd.payload.as_str();

        match (cmd.component.as_str(), cmd.object_id.as_str()) {
            ("switch", "monitoring") => {
                let enabled = payload.eq_ignore_ascii_case("ON");
                self.monitoring.set_enabled(enabled);
                self.mqtt
                    .publish_state("switch", "monitoring", if enabled { "ON" } else { "OFF" })
                    .await?;
            }

            ("button", "analyze_scene") => {
                self.display
                    .show_alert("Analyzing", "Analyzing scene...", "thinking");
                if let Some(frame) = self.latest_frame() {
                    self.analyze_frame(&frame, true).await;
                } else {
                    tracing::warn!("Analyze requested but no camera frame seen yet");
                }
            }

            ("text", "custom_prompt") => {
                self.tunables.write().expect("tunables lock").custom_prompt = payload.to_string();
                self.mqtt
                    .publish_state("text", "custom_prompt", payload)
                    .await?;
            }

            ("number", "monitoring_interval") => {
                let interval: u64 = payload.trim().parse()?;
                self.tunables
                    .write()
                    .expect("tunables lock")
                    .monitoring_interval = interval.max(1);
                self.mqtt
                    .publish_state("number", "monitoring_interval", payload)
                    .await?;
            }

            ("number", "confidence_threshold") => {
                let percent: f64 = payload.trim().parse()?;
                self.tunables
                    .write()
                    .expect("tunables lock")
                    .confidence_threshold = (percent / 100.0).clamp(0.0, 1.0);
                self.mqtt
                    .publish_state("number", "confidence_threshold", payload)
                    .await?;
            }

            ("switch", "voice_assistant") => {
                self.mqtt
                    .publish_state("switch", "voice_assistant", payload)
                    .await?;
            }

            ("notify", "tts") => {
                self.display.show_message(payload);
            }

            ("siren", "alarm") => {
                if payload.eq_ignore_ascii_case("ON") {
                    self.display.show_alert("ALARM", "Alarm triggered!", "shocked");
                } else {
                    self.display.show_emotion("neutral");
                }
                self.mqtt.publish_state("siren", "alarm", payload).await?;
            }

            ("select", "display_mode") => {
                if let Some(mode) = DisplayMode::from_label(payload) {
                    self.display.set_mode(mode);
                    self.mqtt
                        .publish_state("select", "display_mode", payload)
                        .await?;
                } else {
                    tracing::warn!("Unknown display mode: {payload}");
                }
            }

            ("text", "display_message") => {
                self.display.show_message(payload);
                self.mqtt
                    .publish_state("text", "display_message", payload)
                    .await?;
            }

            ("switch", "display_power") => {
                let on = payload.eq_ignore_ascii_case("ON");
                self.display.set_power(on);
                self.mqtt
                    .publish_state("switch", "display_power", if on { "ON" } else { "OFF" })
                    .await?;
            }

            // Raw MCP passthrough: payload is a tool name, or a JSON object
            // {"name": ..., "arguments": {...}}.
            ("raw", "mcp") => {
                let (name, arguments) = match serde_json::from_str::<Value>(payload) {
                    Ok(params) => (
                        params
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or(payload)
                            .to_string(),
                        params.get("arguments").cloned().unwrap_or(json!({})),
                    ),
                    Err(_) => (payload.to_string(), json!({})),
                };
                let rpc_id = self.next_rpc_id();
                self.device
                    .send(device::mcp_tool_call(rpc_id, &name, &arguments));
                tracing::info!("Sent MCP tool call: {name}");
            }

            (component, object_id) => {
                tracing::debug!("Unhandled command: {component}/{object_id}");
            }
        }

        Ok(())
    }

    // ==================== Device messages ====================

    pub async fn process_device_message(&self, text: &str) {
        let message = match DeviceMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("Invalid device message: {e:#}");
                return;
            }
        };

        match message {
            DeviceMessage::Hello { .. } => {
                let session_id = uuid::Uuid::new_v4().to_string();
                self.device.send(device::hello_reply(&session_id));
                tracing::info!("Hello handshake completed, session: {session_id}");

                let rpc_id = self.next_rpc_id();
                self.device
                    .send(device::mcp_initialize(rpc_id, &self.vision_url()));
                tracing::info!("Sent MCP initialize with vision URL");
            }

            DeviceMessage::Listen { state } => {
                tracing::info!("Device listen state: {state}");
                if state == "detect" || state == "start" {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    self.device.send(device::tts_stop());
                    self.device.flush_queue();
                }
            }

            DeviceMessage::Audio { payload } => {
                let audio = match payload.decode() {
                    Ok(audio) => audio,
                    Err(e) => {
                        tracing::warn!("Bad audio payload: {e:#}");
                        return;
                    }
                };
                if audio.is_empty() {
                    return;
                }

                let noise = self.monitoring.detect_noise(&audio);
                let _ = self
                    .mqtt
                    .publish_state(
                        "binary_sensor",
                        "noise_detected",
                        if noise { "ON" } else { "OFF" },
                    )
                    .await;

                let text = self.speech.recognize(audio).await;
                if !text.is_empty() {
                    tracing::info!("STT result: {text}");
                    let _ = self
                        .mqtt
                        .fire_event("voice_command", json!({"text": text}))
                        .await;
                }
            }

            DeviceMessage::Image { payload } => {
                let frame = match payload.decode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Bad image payload: {e:#}");
                        return;
                    }
                };
                if frame.is_empty() {
                    return;
                }

                self.ingest_camera_frame(frame.clone()).await;

                let motion = self.monitoring.detect_motion(&frame);
                let _ = self
                    .mqtt
                    .publish_state(
                        "binary_sensor",
                        "motion_detected",
                        if motion { "ON" } else { "OFF" },
                    )
                    .await;

                if motion {
                    self.analyze_frame(&frame, false).await;
                }
            }

            DeviceMessage::Mcp { payload } => {
                let rendered = payload.to_string();
                tracing::info!("MCP response from device: {}", truncate(&rendered, 500));
                let _ = self
                    .mqtt
                    .publish_state(
                        "sensor",
                        "last_event",
                        format!("MCP: {}", truncate(&rendered, 255)),
                    )
                    .await;
            }

            DeviceMessage::Wheel { payload } => {
                tracing::info!("Wheel event: {}", payload.direction);
            }

            DeviceMessage::Button { payload } => {
                tracing::info!("Button event: {}", payload.action);
            }

            DeviceMessage::Status { payload } => {
                tracing::debug!("Device status: {payload}");
            }
        }
    }

    /// Binary frames carry opus audio; count them, log sparsely.
    pub fn handle_binary_frame(&self, len: usize) {
        let count = self.audio_frames.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 || count % 100 == 0 {
            tracing::debug!("Received {count} audio frames ({len} bytes)");
        }
    }

    /// Analyze a frame, publishing the description and firing an alert when
    /// the model is confident enough.
    async fn analyze_frame(&self, frame: &[u8], force: bool) {
        let prompt = self.analysis_prompt();
        match self
            .monitoring
            .analyze_scene(self.llm.as_ref(), frame, &prompt, force)
            .await
        {
            Ok(Some(result)) => {
                let _ = self
                    .mqtt
                    .publish_state("sensor", "last_event", truncate(&result.description, 255))
                    .await;

                let threshold = self
                    .tunables
                    .read()
                    .expect("tunables lock")
                    .confidence_threshold;
                if result.confidence >= threshold {
                    let _ = self
                        .mqtt
                        .fire_event(
                            "alert",
                            json!({
                                "description": result.description,
                                "confidence": result.confidence,
                            }),
                        )
                        .await;
                    tracing::info!(
                        "Alert fired: confidence={:.2}, desc={}",
                        result.confidence,
                        truncate(&result.description, 50)
                    );
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Vision analysis error: {e:#}"),
        }
    }

    // ==================== Device connection lifecycle ====================

    pub async fn on_device_connected(&self) {
        *self.reconnect_delay.lock().expect("reconnect delay lock") = RECONNECT_DELAY_INITIAL;
        let _ = self
            .mqtt
            .publish_state("binary_sensor", "connected", "ON")
            .await;
        self.device.flush_queue();
    }

    pub async fn on_device_disconnected(&self) {
        let _ = self
            .mqtt
            .publish_state("binary_sensor", "connected", "OFF")
            .await;

        let mut delay = self.reconnect_delay.lock().expect("reconnect delay lock");
        *delay = (*delay * 2).min(RECONNECT_DELAY_MAX);
        tracing::info!(
            "Device disconnected. Next reconnect delay: {}s",
            delay.as_secs()
        );
    }

    // ==================== Monitoring loop ====================

    pub async fn monitoring_loop(self: Arc<Self>) {
        tracing::info!("Starting monitoring loop");
        loop {
            if !self.monitoring.is_enabled() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let interval = self
                .tunables
                .read()
                .expect("tunables lock")
                .monitoring_interval;

            if let Some(frame) = self.latest_frame() {
                let motion = self.monitoring.detect_motion(&frame);
                let _ = self
                    .mqtt
                    .publish_state(
                        "binary_sensor",
                        "motion_detected",
                        if motion { "ON" } else { "OFF" },
                    )
                    .await;

                if motion {
                    self.analyze_frame(&frame, false).await;
                }
            }

            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
    }
}

/// Run the bridge until SIGTERM/SIGINT.
pub async fn run(options: Options) -> Result<()> {
    tracing::info!("Starting SenseCAP Watcher bridge");
    tracing::info!("WebSocket port: {}", options.websocket_port);
    tracing::info!("OTA port: {}", options.ota_port);
    tracing::info!("LLM provider: {}", options.llm_provider);

    let mqtt_settings = MqttSettings::resolve().await;
    tracing::info!(
        "MQTT broker: {}:{} user={:?} password={}",
        mqtt_settings.host,
        mqtt_settings.port,
        mqtt_settings.username,
        mask(&mqtt_settings.password)
    );

    let (mqtt, mut command_rx) = mqtt::start(&mqtt_settings);
    let bridge = Bridge::new(options, mqtt)?;

    bridge.mqtt.register_entities().await?;
    bridge.mqtt.publish_availability(true).await?;

    let mut tasks = Vec::new();

    let ws_bridge = bridge.clone();
    tasks.push(tokio::spawn(async move {
        let port = ws_bridge.options.websocket_port;
        if let Err(e) = ws_server::serve(ws_bridge, port).await {
            tracing::error!("WebSocket server failed: {e:#}");
        }
    }));

    let ota_bridge = bridge.clone();
    tasks.push(tokio::spawn(async move {
        let port = ota_bridge.options.ota_port;
        if let Err(e) = ota::serve(ota_bridge, port).await {
            tracing::error!("OTA server failed: {e:#}");
        }
    }));

    tasks.push(tokio::spawn(bridge.clone().monitoring_loop()));

    if let Some(mcp_url) = bridge.options.sensecraft_mcp_url.clone() {
        match std::env::var("SUPERVISOR_TOKEN") {
            Ok(token) if !token.is_empty() => {
                let ha = Arc::new(HaClient::new(token)?);
                tasks.push(tokio::spawn(SenseCraftMcp::new(mcp_url, ha).run()));
                tracing::info!("SenseCraft MCP bridge started");
            }
            _ => tracing::warn!("sensecraft_mcp_url set but SUPERVISOR_TOKEN missing, skipping"),
        }
    }

    tracing::info!("Watcher bridge started");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(cmd) => bridge.handle_command(cmd).await,
                    None => {
                        tracing::error!("MQTT command channel closed");
                        break;
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    bridge.mqtt.publish_availability(false).await.ok();
    let _ = bridge
        .mqtt
        .publish_state("binary_sensor", "connected", "OFF")
        .await;
    // The event loop needs a beat to flush the offline publishes.
    tokio::time::sleep(Duration::from_millis(500)).await;
    for task in tasks {
        task.abort();
    }
    tracing::info!("Watcher bridge shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
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
    fn test_truncate() {
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("hi", 10), "hi");
        // Multi-byte input must not split a character.
        assert_eq!(truncate("обнаружен человек", 9), "обнаружен");
    }
}
