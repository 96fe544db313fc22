//! Device display control.
//!
//! The Watcher's screen is driven indirectly: the firmware renders an emoji
//! face for an "emotion", and TTS sentence events double as message display.
//! Display modes selected in Home Assistant map onto emotions.

use serde_json::json;
use std::sync::Arc;
use std::sync::Mutex;

use crate::device::DeviceLink;

/// Emoji names supported by the xiaozhi firmware (Twemoji set).
pub const EMOTIONS: [&str; 21] = [
    "neutral",
    "happy",
    "laughing",
    "funny",
    "sad",
    "angry",
    "crying",
    "loving",
    "embarrassed",
    "surprised",
    "shocked",
    "thinking",
    "winking",
    "cool",
    "relaxed",
    "delicious",
    "kissy",
    "confident",
    "sleepy",
    "silly",
    "confused",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Clock,
    Weather,
    Status,
    AiLog,
    Custom,
}

impl DisplayMode {
    /// Parse the select-entity option label.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Clock" => Some(Self::Clock),
            "Weather" => Some(Self::Weather),
            "Status" => Some(Self::Status),
            "AI Log" => Some(Self::AiLog),
            "Custom" => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Clock => "Clock",
            Self::Weather => "Weather",
            Self::Status => "Status",
            Self::AiLog => "AI Log",
            Self::Custom => "Custom",
        }
    }

    pub fn emotion(&self) -> &'static str {
        match self {
            Self::Clock | Self::Custom => "neutral",
            Self::Weather => "cool",
            Self::Status => "thinking",
            Self::AiLog => "confident",
        }
    }
}

pub fn emotion_command(emotion: &str) -> String {
    json!({"type": "llm", "emotion": emotion}).to_string()
}

pub fn message_command(text: &str) -> String {
    json!({"type": "tts", "state": "sentence_start", "text": text}).to_string()
}

pub fn alert_command(status: &str, message: &str, emotion: &str) -> String {
    json!({
        "type": "alert",
        "status": status,
        "message": message,
        "emotion": emotion,
    })
    .to_string()
}

/// Tracks display state and pushes commands to the device.
pub struct DisplayManager {
    link: Arc<DeviceLink>,
    mode: Mutex<DisplayMode>,
    power: Mutex<bool>,
}

impl DisplayManager {
    pub fn new(link: Arc<DeviceLink>) -> Self {
        Self {
            link,
            mode: Mutex::new(DisplayMode::Clock),
            power: Mutex::new(true),
        }
    }

    pub fn mode(&self) -> DisplayMode {
        *self.mode.lock().expect("display mode lock")
    }

    pub fn power(&self) -> bool {
        *self.power.lock().expect("display power lock")
    }

    pub fn set_mode(&self, mode: DisplayMode) {
        *self.mode.lock().expect("display mode lock") = mode;
        tracing::info!("Display mode: {} (emotion: {})", mode.label(), mode.emotion());
        self.link.send(emotion_command(mode.emotion()));
    }

    pub fn set_power(&self, on: bool) {
        *self.power.lock().expect("display power lock") = on;
        tracing::info!("Display power: {}", if on { "ON" } else { "OFF" });
        if on {
            self.link.send(emotion_command("neutral"));
        }
    }

    pub fn show_message(&self, text: &str) {
        self.link.send(message_command(text));
    }

    pub fn show_emotion(&self, emotion: &str) {
        if !EMOTIONS.contains(&emotion) {
            tracing::warn!("Invalid emotion: {emotion}");
            return;
        }
        self.link.send(emotion_command(emotion));
    }

    pub fn show_alert(&self, status: &str, message: &str, emotion: &str) {
        self.link.send(alert_command(status, message, emotion));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_labels_roundtrip() {
        for mode in [
            DisplayMode::Clock,
            DisplayMode::Weather,
            DisplayMode::Status,
            DisplayMode::AiLog,
            DisplayMode::Custom,
        ] {
            assert_eq!(DisplayMode::from_label(mode.label()), Some(mode));
        }
        assert_eq!(DisplayMode::from_label("Disco"), None);
    }

    #[test]
    fn test_mode_emotions_are_valid() {
        for mode in [
            DisplayMode::Clock,
            DisplayMode::Weather,
            DisplayMode::Status,
            DisplayMode::AiLog,
            DisplayMode::Custom,
        ] {
            assert!(EMOTIONS.contains(&mode.emotion()));
        }
    }

    #[test]
    fn test_invalid_emotion_is_not_sent() {
        let link = Arc::new(DeviceLink::new());
        let (_, mut rx) = link.attach();
        let display = DisplayManager::new(link);

        display.show_emotion("grumpy");
        assert!(rx.try_recv().is_err());

        display.show_emotion("happy");
        let sent: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(sent["emotion"], "happy");
    }

    #[test]
    fn test_alert_command_shape() {
        let cmd: serde_json::Value =
            serde_json::from_str(&alert_command("ALARM", "Alarm triggered!", "shocked")).unwrap();
        assert_eq!(cmd["type"], "alert");
        assert_eq!(cmd["status"], "ALARM");
        assert_eq!(cmd["emotion"], "shocked");
    }
}
