use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

use watcher_bridge::config::{load_options, MqttSettings};
use watcher_bridge::device::DeviceMessage;
use watcher_bridge::entities;
use watcher_bridge::llm::create_provider;

fn write_options(content: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("options.json");
    fs::write(&path, content).unwrap();
    (tmp, path)
}

#[test]
fn test_missing_options_file_uses_defaults() {
    let tmp = TempDir::new().unwrap();
    let options = load_options(&tmp.path().join("does-not-exist.json")).unwrap();
    assert_eq!(options.llm_provider, "claude");
    assert_eq!(options.websocket_port, 8000);
    assert_eq!(options.ota_port, 8001);
    assert_eq!(options.snapshot_dir, "/share/watcher/snapshots");
}

#[test]
fn test_options_file_overrides_defaults() {
    let (_tmp, path) = write_options(
        r#"{
            "llm_provider": "ollama",
            "ollama_url": "http://ollama.lan:11434",
            "ollama_vision_model": "moondream",
            "monitoring_interval": 120,
            "confidence_threshold": 0.9,
            "websocket_port": 9000,
            "ota_port": 9001,
            "custom_prompt": "Is anyone at the door?"
        }"#,
    );

    let options = load_options(&path).unwrap();
    assert_eq!(options.llm_provider, "ollama");
    assert_eq!(options.ollama_url, "http://ollama.lan:11434");
    assert_eq!(options.ollama_vision_model, "moondream");
    assert_eq!(options.monitoring_interval, 120);
    assert!((options.confidence_threshold - 0.9).abs() < f64::EPSILON);
    assert_eq!(options.websocket_port, 9000);
    assert_eq!(options.custom_prompt, "Is anyone at the door?");
}

#[test]
fn test_unknown_provider_is_rejected() {
    let (_tmp, path) = write_options(r#"{"llm_provider": "bard"}"#);
    let err = load_options(&path).unwrap_err();
    assert!(err.to_string().contains("Unknown llm_provider"));
}

#[test]
fn test_claude_without_endpoints_is_rejected() {
    let (_tmp, path) = write_options(r#"{"llm_provider": "claude"}"#);
    assert!(load_options(&path).is_err());
}

#[test]
fn test_claude_with_fallback_only_is_accepted() {
    let (_tmp, path) = write_options(
        r#"{
            "llm_provider": "claude",
            "claude_fallback_url": "https://proxy.example/v1/messages",
            "claude_fallback_key": "sk-abc"
        }"#,
    );
    let options = load_options(&path).unwrap();
    let provider = create_provider(&options).unwrap();
    assert_eq!(provider.name(), "claude");
}

#[test]
fn test_out_of_range_threshold_is_rejected() {
    let (_tmp, path) =
        write_options(r#"{"llm_provider": "ollama", "confidence_threshold": 1.5}"#);
    assert!(load_options(&path).is_err());
}

#[test]
fn test_colliding_ports_are_rejected() {
    let (_tmp, path) = write_options(
        r#"{"llm_provider": "ollama", "websocket_port": 8000, "ota_port": 8000}"#,
    );
    assert!(load_options(&path).is_err());
}

#[test]
fn test_malformed_options_file_is_rejected() {
    let (_tmp, path) = write_options("{not json");
    assert!(load_options(&path).is_err());
}

// Environment fallback is process-global state; everything env-related
// lives in this one test to keep the suite parallel-safe.
#[test]
fn test_mqtt_env_fallback() {
    std::env::set_var("MQTT_HOST", "broker.lan");
    std::env::set_var("MQTT_PORT", "8883");
    std::env::set_var("MQTT_USER", "watcher");
    std::env::remove_var("MQTT_PASSWORD");
    std::env::set_var("MQTT_PASS", "legacy-secret");

    let settings = MqttSettings::from_env();
    assert_eq!(settings.host, "broker.lan");
    assert_eq!(settings.port, 8883);
    assert_eq!(settings.username, "watcher");
    // Legacy MQTT_PASS name is honored when MQTT_PASSWORD is absent.
    assert_eq!(settings.password, "legacy-secret");

    std::env::set_var("MQTT_PORT", "not-a-port");
    let settings = MqttSettings::from_env();
    assert_eq!(settings.port, 1883);

    for var in ["MQTT_HOST", "MQTT_PORT", "MQTT_USER", "MQTT_PASS"] {
        std::env::remove_var(var);
    }
    let settings = MqttSettings::from_env();
    assert_eq!(settings.host, "core-mosquitto");
    assert_eq!(settings.port, 1883);
}

#[test]
fn test_discovery_payloads_reference_registered_topics() {
    // Every command topic a discovery payload advertises must parse back
    // into the command routing scheme, or Home Assistant would publish
    // commands the bridge never sees.
    for entity in entities::entity_configs() {
        if let Some(command_topic) = entity.config.get("command_topic") {
            let topic = command_topic.as_str().unwrap();
            let parsed = entities::parse_command_topic(topic);
            assert_eq!(
                parsed,
                Some((entity.component.to_string(), entity.object_id.to_string())),
                "command topic {topic} does not round-trip"
            );
        }
    }
}

#[test]
fn test_discovery_set_matches_documented_entities() {
    let entities = entities::entity_configs();
    let count_of = |component: &str| {
        entities
            .iter()
            .filter(|e| e.component == component)
            .count()
    };

    assert_eq!(count_of("switch"), 3);
    assert_eq!(count_of("binary_sensor"), 3);
    assert_eq!(count_of("number"), 2);
    assert_eq!(count_of("text"), 2);
    assert_eq!(count_of("sensor"), 1);
    assert_eq!(count_of("image"), 1);
    assert_eq!(count_of("button"), 1);
    assert_eq!(count_of("notify"), 1);
    assert_eq!(count_of("siren"), 1);
    assert_eq!(count_of("select"), 1);
}

#[test]
fn test_device_image_message_roundtrip() {
    let jpeg_magic = [0xffu8, 0xd8, 0xff, 0xe0];
    let message = format!(
        r#"{{"type": "image", "payload": {{"data": "{}"}}}}"#,
        hex::encode(jpeg_magic)
    );

    match DeviceMessage::parse(&message).unwrap() {
        DeviceMessage::Image { payload } => {
            assert_eq!(payload.decode().unwrap(), jpeg_magic);
        }
        other => panic!("unexpected message: {other:?}"),
    }
}
