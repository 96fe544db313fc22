//! Device protocol model and connection handle.
//!
//! The Watcher speaks the xiaozhi WebSocket dialect: JSON text frames with a
//! `type` discriminator, plus binary frames carrying opus audio. Audio and
//! image payloads inside JSON frames are hex-encoded.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Audio parameters announced in the hello handshake.
const AUDIO_SAMPLE_RATE: u32 = 24_000;
const AUDIO_FRAME_DURATION_MS: u32 = 60;

/// Incoming JSON message from the device.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    Hello {
        #[serde(default)]
        #[allow(dead_code)]
        version: Option<u32>,
    },
    Listen {
        #[serde(default)]
        state: String,
    },
    Audio {
        payload: FramePayload,
    },
    Image {
        payload: FramePayload,
    },
    Mcp {
        #[serde(default)]
        payload: Value,
    },
    Wheel {
        #[serde(default)]
        payload: WheelPayload,
    },
    Button {
        #[serde(default)]
        payload: ButtonPayload,
    },
    Status {
        #[serde(default)]
        payload: Value,
    },
}

/// Hex-encoded binary payload (audio samples, JPEG frames).
#[derive(Debug, Default, Deserialize)]
pub struct FramePayload {
    #[serde(default)]
    pub data: String,
}

impl FramePayload {
    pub fn decode(&self) -> Result<Vec<u8>> {
        hex::decode(&self.data).context("payload data is not valid hex")
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WheelPayload {
    #[serde(default)]
    pub direction: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ButtonPayload {
    #[serde(default)]
    pub action: String,
}

impl DeviceMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid device message")
    }
}

/// Hello response completing the handshake.
pub fn hello_reply(session_id: &str) -> String {
    json!({
        "type": "hello",
        "transport": "websocket",
        "session_id": session_id,
        "audio_params": {
            "sample_rate": AUDIO_SAMPLE_RATE,
            "frame_duration": AUDIO_FRAME_DURATION_MS,
        },
    })
    .to_string()
}

/// MCP `initialize` advertising the vision endpoint to the device firmware.
pub fn mcp_initialize(rpc_id: u64, vision_url: &str) -> String {
    json!({
        "type": "mcp",
        "payload": {
            "jsonrpc": "2.0",
            "id": rpc_id,
            "method": "initialize",
            "params": {
                "capabilities": {
                    "vision": {
                        "url": vision_url,
                        "token": "sensecap-local",
                    }
                }
            },
        },
    })
    .to_string()
}

/// MCP `tools/call` passthrough for raw tool invocations from HA.
pub fn mcp_tool_call(rpc_id: u64, name: &str, arguments: &Value) -> String {
    json!({
        "type": "mcp",
        "payload": {
            "jsonrpc": "2.0",
            "id": rpc_id,
            "method": "tools/call",
            "params": {
                "name": name,
                "arguments": arguments,
            },
        },
    })
    .to_string()
}

/// TTS stop, which ends the device's listen session.
pub fn tts_stop() -> String {
    json!({"type": "tts", "state": "stop"}).to_string()
}

/// Handle to the (single) device connection.
///
/// At most one device is connected at a time; a new connection replaces the
/// previous sender. Messages sent while no device is attached are queued and
/// flushed in order on the next attach.
#[derive(Default)]
pub struct DeviceLink {
    sender: Mutex<Option<(u64, mpsc::UnboundedSender<String>)>>,
    generation: std::sync::atomic::AtomicU64,
    queue: Mutex<VecDeque<String>>,
}

impl DeviceLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new connection, displacing any previous one. Returns the
    /// connection's generation tag and the receiver the socket task drains.
    pub fn attach(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().expect("device sender lock") = Some((generation, tx));
        (generation, rx)
    }

    /// Detach a connection. A stale generation is a no-op so a dying socket
    /// task cannot tear down the connection that replaced it.
    pub fn detach(&self, generation: u64) {
        let mut sender = self.sender.lock().expect("device sender lock");
        if matches!(*sender, Some((current, _)) if current == generation) {
            *sender = None;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sender.lock().expect("device sender lock").is_some()
    }

    /// Send to the device, or queue for delivery when it reconnects.
    pub fn send(&self, message: String) {
        let sender = self.sender.lock().expect("device sender lock");
        if let Some((_, tx)) = sender.as_ref() {
            if tx.send(message.clone()).is_ok() {
                return;
            }
        }
        drop(sender);

        let mut queue = self.queue.lock().expect("device queue lock");
        queue.push_back(message);
        tracing::info!("Command queued for delivery (queue size: {})", queue.len());
    }

    /// Deliver queued commands in FIFO order. Stops and requeues on the
    /// first failure so ordering is preserved across reconnects.
    pub fn flush_queue(&self) {
        let mut pending: VecDeque<String> = {
            let mut queue = self.queue.lock().expect("device queue lock");
            std::mem::take(&mut *queue)
        };

        if pending.is_empty() {
            return;
        }
        tracing::info!("Flushing {} queued commands", pending.len());

        let sender = self.sender.lock().expect("device sender lock");
        while let Some(msg) = pending.pop_front() {
            let delivered = sender.as_ref().map(|(_, tx)| tx.send(msg.clone()).is_ok());
            if delivered != Some(true) {
                pending.push_front(msg);
                break;
            }
        }
        drop(sender);

        if !pending.is_empty() {
            let mut queue = self.queue.lock().expect("device queue lock");
            // Anything queued while flushing goes after the requeued remainder.
            pending.extend(queue.drain(..));
            *queue = pending;
        }
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hello() {
        let msg = DeviceMessage::parse(r#"{"type": "hello", "version": 3}"#).unwrap();
        assert!(matches!(msg, DeviceMessage::Hello { .. }));
    }

    #[test]
    fn test_parse_listen_state() {
        let msg = DeviceMessage::parse(r#"{"type": "listen", "state": "detect"}"#).unwrap();
        match msg {
            DeviceMessage::Listen { state } => assert_eq!(state, "detect"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_image_payload_hex() {
        let msg =
            DeviceMessage::parse(r#"{"type": "image", "payload": {"data": "ffd8ffe0"}}"#).unwrap();
        match msg {
            DeviceMessage::Image { payload } => {
                assert_eq!(payload.decode().unwrap(), vec![0xff, 0xd8, 0xff, 0xe0]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_bad_hex_fails_on_decode() {
        let msg =
            DeviceMessage::parse(r#"{"type": "audio", "payload": {"data": "zz"}}"#).unwrap();
        match msg {
            DeviceMessage::Audio { payload } => assert!(payload.decode().is_err()),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_type_is_error() {
        assert!(DeviceMessage::parse(r#"{"type": "telemetry"}"#).is_err());
        assert!(DeviceMessage::parse("not json").is_err());
    }

    #[test]
    fn test_hello_reply_shape() {
        let reply: Value = serde_json::from_str(&hello_reply("abc-123")).unwrap();
        assert_eq!(reply["type"], "hello");
        assert_eq!(reply["session_id"], "abc-123");
        assert_eq!(reply["audio_params"]["sample_rate"], 24000);
    }

    #[test]
    fn test_mcp_initialize_carries_vision_url() {
        let msg: Value =
            serde_json::from_str(&mcp_initialize(7, "http://10.0.0.2:8001/vision/explain"))
                .unwrap();
        assert_eq!(msg["payload"]["id"], 7);
        assert_eq!(
            msg["payload"]["params"]["capabilities"]["vision"]["url"],
            "http://10.0.0.2:8001/vision/explain"
        );
    }

    #[test]
    fn test_link_queues_when_detached() {
        let link = DeviceLink::new();
        link.send("one".to_string());
        link.send("two".to_string());
        assert_eq!(link.queued(), 2);
    }

    #[test]
    fn test_link_flushes_in_order_on_attach() {
        let link = DeviceLink::new();
        link.send("one".to_string());
        link.send("two".to_string());

        let (_, mut rx) = link.attach();
        link.flush_queue();

        assert_eq!(rx.try_recv().unwrap(), "one");
        assert_eq!(rx.try_recv().unwrap(), "two");
        assert_eq!(link.queued(), 0);
    }

    #[test]
    fn test_link_sends_directly_when_attached() {
        let link = DeviceLink::new();
        let (_, mut rx) = link.attach();
        link.send("now".to_string());
        assert_eq!(rx.try_recv().unwrap(), "now");
        assert_eq!(link.queued(), 0);
    }

    #[test]
    fn test_link_requeues_after_receiver_drop() {
        let link = DeviceLink::new();
        let (_, rx) = link.attach();
        drop(rx);
        link.send("lost".to_string());
        assert_eq!(link.queued(), 1);
    }

    #[test]
    fn test_stale_detach_does_not_break_newer_connection() {
        let link = DeviceLink::new();
        let (old_gen, _old_rx) = link.attach();
        let (_, mut new_rx) = link.attach();

        link.detach(old_gen);
        assert!(link.is_connected());

        link.send("still here".to_string());
        assert_eq!(new_rx.try_recv().unwrap(), "still here");
    }
}
