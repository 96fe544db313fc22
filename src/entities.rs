//! Home Assistant entity registry for the Watcher device.
//!
//! Everything Home Assistant sees is declared here: the MQTT Discovery
//! payloads for all entities, the event entities, the topic scheme, and the
//! initial retained states published after registration.
//!
//! # Topic scheme
//!
//! | Purpose | Topic |
//! |---------|-------|
//! | Discovery | `homeassistant/{component}/sensecap_watcher/{object_id}/config` |
//! | State | `sensecap_watcher/{component}/{object_id}/state` |
//! | Command | `sensecap_watcher/{component}/{object_id}/set` |
//! | Event | `sensecap_watcher/event/{event_type}/state` |
//! | Availability | `sensecap_watcher/availability` |

use serde_json::{json, Value};

/// Node id shared by every topic and unique_id.
pub const NODE_ID: &str = "sensecap_watcher";

/// Bridge availability topic, used as the MQTT Last Will.
pub const AVAILABILITY_TOPIC: &str = "sensecap_watcher/availability";

/// Topic carrying the latest camera frame (raw JPEG, retained).
pub const SNAPSHOT_IMAGE_TOPIC: &str = "sensecap_watcher/image/snapshot/image";

/// Device block attached to every discovery payload so Home Assistant
/// groups all entities under one device.
pub fn device_info() -> Value {
    json!({
        "identifiers": [NODE_ID],
        "name": "SenseCAP Watcher",
        "manufacturer": "Seeed Studio",
        "model": "SenseCAP Watcher",
    })
}

pub fn discovery_topic(component: &str, object_id: &str) -> String {
    format!("homeassistant/{}/{}/{}/config", component, NODE_ID, object_id)
}

pub fn state_topic(component: &str, object_id: &str) -> String {
    format!("{}/{}/{}/state", NODE_ID, component, object_id)
}

pub fn command_topic(component: &str, object_id: &str) -> String {
    format!("{}/{}/{}/set", NODE_ID, component, object_id)
}

pub fn event_topic(event_type: &str) -> String {
    format!("{}/event/{}/state", NODE_ID, event_type)
}

/// An entity to register via MQTT Discovery.
pub struct EntityConfig {
    pub component: &'static str,
    pub object_id: &'static str,
    pub config: Value,
}

/// All entities exposed by the bridge.
///
/// The set mirrors the add-on documentation: one image, three switches, one
/// sensor, two text inputs, one button, three binary sensors, two numbers,
/// a notify target, a siren, and a select.
pub fn entity_configs() -> Vec<EntityConfig> {
    let device = device_info();
    let mut entities = Vec::new();

    let mut push = |component: &'static str, object_id: &'static str, mut config: Value| {
        let obj = config.as_object_mut().expect("entity config is an object");
        obj.insert(
            "unique_id".to_string(),
            json!(format!("{}_{}", NODE_ID, object_id)),
        );
        obj.insert("device".to_string(), device.clone());
        obj.insert("availability_topic".to_string(), json!(AVAILABILITY_TOPIC));
        entities.push(EntityConfig {
            component,
            object_id,
            config,
        });
    };

    push(
        "image",
        "snapshot",
        json!({
            "name": "Watcher Snapshot",
            "image_topic": SNAPSHOT_IMAGE_TOPIC,
            "content_type": "image/jpeg",
        }),
    );

    push(
        "switch",
        "monitoring",
        json!({
            "name": "Watcher Monitoring",
            "state_topic": state_topic("switch", "monitoring"),
            "command_topic": command_topic("switch", "monitoring"),
            "payload_on": "ON",
            "payload_off": "OFF",
        }),
    );

    push(
        "sensor",
        "last_event",
        json!({
            "name": "Watcher Last Event",
            "state_topic": state_topic("sensor", "last_event"),
            "icon": "mdi:message-text",
        }),
    );

    push(
        "text",
        "custom_prompt",
        json!({
            "name": "Watcher Custom Prompt",
            "state_topic": state_topic("text", "custom_prompt"),
            "command_topic": command_topic("text", "custom_prompt"),
            "mode": "text",
            "max": 500,
        }),
    );

    push(
        "button",
        "analyze_scene",
        json!({
            "name": "Watcher Analyze Scene",
            "command_topic": command_topic("button", "analyze_scene"),
            "payload_press": "PRESS",
            "icon": "mdi:eye",
        }),
    );

    push(
        "binary_sensor",
        "motion_detected",
        json!({
            "name": "Watcher Motion Detected",
            "state_topic": state_topic("binary_sensor", "motion_detected"),
            "payload_on": "ON",
            "payload_off": "OFF",
            "device_class": "motion",
        }),
    );

    push(
        "number",
        "monitoring_interval",
        json!({
            "name": "Watcher Monitoring Interval",
            "state_topic": state_topic("number", "monitoring_interval"),
            "command_topic": command_topic("number", "monitoring_interval"),
            "min": 10,
            "max": 300,
            "step": 1,
            "unit_of_measurement": "s",
            "icon": "mdi:timer",
        }),
    );

    push(
        "number",
        "confidence_threshold",
        json!({
            "name": "Watcher Confidence Threshold",
            "state_topic": state_topic("number", "confidence_threshold"),
            "command_topic": command_topic("number", "confidence_threshold"),
            "min": 0,
            "max": 100,
            "step": 1,
            "unit_of_measurement": "%",
            "icon": "mdi:percent",
        }),
    );

    push(
        "switch",
        "voice_assistant",
        json!({
            "name": "Watcher Voice Assistant",
            "state_topic": state_topic("switch", "voice_assistant"),
            "command_topic": command_topic("switch", "voice_assistant"),
            "payload_on": "ON",
            "payload_off": "OFF",
            "icon": "mdi:microphone",
        }),
    );

    push(
        "notify",
        "tts",
        json!({
            "name": "Watcher TTS",
            "command_topic": command_topic("notify", "tts"),
            "icon": "mdi:text-to-speech",
        }),
    );

    push(
        "siren",
        "alarm",
        json!({
            "name": "Watcher Siren",
            "state_topic": state_topic("siren", "alarm"),
            "command_topic": command_topic("siren", "alarm"),
            "payload_on": "ON",
            "payload_off": "OFF",
            "available_tones": ["alarm", "alert", "chime"],
            "support_duration": true,
            "support_volume_set": true,
        }),
    );

    push(
        "binary_sensor",
        "noise_detected",
        json!({
            "name": "Watcher Noise Detected",
            "state_topic": state_topic("binary_sensor", "noise_detected"),
            "payload_on": "ON",
            "payload_off": "OFF",
            "device_class": "sound",
        }),
    );

    push(
        "select",
        "display_mode",
        json!({
            "name": "Watcher Display Mode",
            "state_topic": state_topic("select", "display_mode"),
            "command_topic": command_topic("select", "display_mode"),
            "options": ["Clock", "Weather", "Status", "AI Log", "Custom"],
            "icon": "mdi:monitor",
        }),
    );

    push(
        "text",
        "display_message",
        json!({
            "name": "Watcher Display Message",
            "state_topic": state_topic("text", "display_message"),
            "command_topic": command_topic("text", "display_message"),
            "mode": "text",
            "max": 100,
            "icon": "mdi:message-text-outline",
        }),
    );

    push(
        "switch",
        "display_power",
        json!({
            "name": "Watcher Display Power",
            "state_topic": state_topic("switch", "display_power"),
            "command_topic": command_topic("switch", "display_power"),
            "payload_on": "ON",
            "payload_off": "OFF",
            "icon": "mdi:monitor-shimmer",
        }),
    );

    push(
        "binary_sensor",
        "connected",
        json!({
            "name": "Watcher Connected",
            "state_topic": state_topic("binary_sensor", "connected"),
            "payload_on": "ON",
            "payload_off": "OFF",
            "device_class": "connectivity",
        }),
    );

    entities
}

/// Event entities (`alert`, `voice_command`) — separate discovery prefix,
/// published without retain at fire time.
pub fn event_configs() -> Vec<(String, Value)> {
    let device = device_info();
    vec![
        (
            format!("homeassistant/event/{}_alert/config", NODE_ID),
            json!({
                "name": "Watcher Alert",
                "unique_id": format!("{}_alert", NODE_ID),
                "state_topic": event_topic("alert"),
                "event_types": ["alert"],
                "device": device.clone(),
            }),
        ),
        (
            format!("homeassistant/event/{}_voice_command/config", NODE_ID),
            json!({
                "name": "Watcher Voice Command",
                "unique_id": format!("{}_voice_command", NODE_ID),
                "state_topic": event_topic("voice_command"),
                "event_types": ["voice_command"],
                "device": device,
            }),
        ),
    ]
}

/// Retained states published right after discovery so the dashboard renders
/// with sane values before the first real update.
pub fn initial_states() -> Vec<(&'static str, &'static str, &'static str)> {
    vec![
        ("switch", "monitoring", "OFF"),
        ("switch", "voice_assistant", "OFF"),
        ("switch", "display_power", "ON"),
        ("binary_sensor", "connected", "OFF"),
        ("binary_sensor", "motion_detected", "OFF"),
        ("binary_sensor", "noise_detected", "OFF"),
        ("sensor", "last_event", ""),
        ("number", "monitoring_interval", "30"),
        ("number", "confidence_threshold", "50"),
        ("text", "custom_prompt", ""),
        ("text", "display_message", ""),
        ("select", "display_mode", "Clock"),
        ("siren", "alarm", "OFF"),
    ]
}

/// Parse a command topic back into `(component, object_id)`.
///
/// Returns `None` for topics outside the `sensecap_watcher/+/+/set` scheme.
pub fn parse_command_topic(topic: &str) -> Option<(String, String)> {
    let mut parts = topic.split('/');
    if parts.next()? != NODE_ID {
        return None;
    }
    let component = parts.next()?;
    let object_id = parts.next()?;
    if parts.next()? != "set" || parts.next().is_some() {
        return None;
    }
    Some((component.to_string(), object_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_entity_count() {
        assert_eq!(entity_configs().len(), 16);
        assert_eq!(event_configs().len(), 2);
    }

    #[test]
    fn test_unique_ids_are_unique() {
        let entities = entity_configs();
        let ids: HashSet<String> = entities
            .iter()
            .map(|e| e.config["unique_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids.len(), entities.len());
    }

    #[test]
    fn test_every_entity_has_device_and_availability() {
        for e in entity_configs() {
            assert!(e.config["device"].is_object(), "{} missing device", e.object_id);
            assert_eq!(
                e.config["availability_topic"].as_str().unwrap(),
                AVAILABILITY_TOPIC
            );
        }
    }

    #[test]
    fn test_topic_scheme() {
        assert_eq!(
            discovery_topic("switch", "monitoring"),
            "homeassistant/switch/sensecap_watcher/monitoring/config"
        );
        assert_eq!(
            state_topic("sensor", "last_event"),
            "sensecap_watcher/sensor/last_event/state"
        );
        assert_eq!(
            command_topic("number", "confidence_threshold"),
            "sensecap_watcher/number/confidence_threshold/set"
        );
    }

    #[test]
    fn test_parse_command_topic() {
        assert_eq!(
            parse_command_topic("sensecap_watcher/switch/monitoring/set"),
            Some(("switch".to_string(), "monitoring".to_string()))
        );
        assert_eq!(parse_command_topic("sensecap_watcher/switch/monitoring/state"), None);
        assert_eq!(parse_command_topic("other_node/switch/monitoring/set"), None);
        assert_eq!(parse_command_topic("sensecap_watcher/switch/set"), None);
    }

    #[test]
    fn test_initial_states_cover_stateful_entities() {
        let initial: HashSet<(&str, &str)> = initial_states()
            .iter()
            .map(|(c, o, _)| (*c, *o))
            .collect();
        // Every switch/select/siren with a state topic gets a retained default.
        assert!(initial.contains(&("switch", "monitoring")));
        assert!(initial.contains(&("select", "display_mode")));
        assert!(initial.contains(&("siren", "alarm")));
    }
}
