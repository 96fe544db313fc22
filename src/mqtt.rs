//! MQTT session against the Home Assistant broker.
//!
//! Owns the rumqttc client and its event loop. The event loop task handles
//! reconnects: every `ConnAck` re-subscribes the command topics and
//! republishes availability, so a broker restart heals without help. The
//! Last Will flips availability to `offline` if the bridge dies uncleanly.
//!
//! Incoming entity commands (`sensecap_watcher/+/+/set`) are forwarded to
//! the orchestrator over a channel; nothing in here knows what a command
//! means.

use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::MqttSettings;
use crate::entities;

const CLIENT_ID: &str = "sensecap_watcher_bridge";
const COMMAND_FILTER: &str = "sensecap_watcher/+/+/set";

/// An entity command received from Home Assistant.
#[derive(Debug, Clone)]
pub struct Command {
    pub component: String,
    pub object_id: String,
    pub payload: String,
}

/// Handle for publishing to the broker.
#[derive(Clone)]
pub struct MqttSession {
    client: AsyncClient,
}

/// Connect and spawn the event loop task.
///
/// Returns the publish handle and the channel entity commands arrive on.
pub fn start(settings: &MqttSettings) -> (MqttSession, mpsc::UnboundedReceiver<Command>) {
    let mut options = MqttOptions::new(CLIENT_ID, &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_last_will(LastWill::new(
        entities::AVAILABILITY_TOPIC,
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    if !settings.username.is_empty() {
        options.set_credentials(&settings.username, &settings.password);
    }

    tracing::info!(
        "Connecting to MQTT broker at {}:{}",
        settings.host,
        settings.port
    );

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let loop_client = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    tracing::info!("Connected to MQTT broker");
                    if let Err(e) = loop_client
                        .subscribe(COMMAND_FILTER, QoS::AtLeastOnce)
                        .await
                    {
                        tracing::error!("Command subscription failed: {e}");
                    }
                    let _ = loop_client
                        .publish(entities::AVAILABILITY_TOPIC, QoS::AtLeastOnce, true, "online")
                        .await;
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let Some((component, object_id)) =
                        entities::parse_command_topic(&publish.topic)
                    else {
                        tracing::debug!("Ignoring message on {}", publish.topic);
                        continue;
                    };
                    let payload = String::from_utf8_lossy(&publish.payload).to_string();
                    tracing::info!(
                        "HA command: {}/{} = {}",
                        component,
                        object_id,
                        payload
                    );
                    if command_tx
                        .send(Command {
                            component,
                            object_id,
                            payload,
                        })
                        .is_err()
                    {
                        // Orchestrator is gone, nothing left to do.
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("MQTT connection error: {e}, retrying in 5s");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });

    (MqttSession { client }, command_rx)
}

impl MqttSession {
    pub async fn publish_raw(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        retain: bool,
    ) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.into())
            .await?;
        Ok(())
    }

    pub async fn publish_json(&self, topic: &str, value: &Value, retain: bool) -> Result<()> {
        self.publish_raw(topic, value.to_string(), retain).await
    }

    /// Publish a retained entity state.
    pub async fn publish_state(
        &self,
        component: &str,
        object_id: &str,
        state: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.publish_raw(&entities::state_topic(component, object_id), state, true)
            .await
    }

    pub async fn publish_availability(&self, online: bool) -> Result<()> {
        self.publish_raw(
            entities::AVAILABILITY_TOPIC,
            if online { "online" } else { "offline" },
            true,
        )
        .await
    }

    /// Fire a Home Assistant event (not retained).
    pub async fn fire_event(&self, event_type: &str, data: Value) -> Result<()> {
        let payload = event_payload(event_type, data);
        tracing::info!("Fired event {event_type}");
        self.publish_json(&entities::event_topic(event_type), &payload, false)
            .await
    }

    /// Publish every discovery config, then the initial retained states.
    pub async fn register_entities(&self) -> Result<()> {
        let configs = entities::entity_configs();
        for entity in &configs {
            self.publish_json(
                &entities::discovery_topic(entity.component, entity.object_id),
                &entity.config,
                true,
            )
            .await?;
            tracing::debug!("Registered entity: {}/{}", entity.component, entity.object_id);
        }

        let events = entities::event_configs();
        for (topic, config) in &events {
            self.publish_json(topic, config, true).await?;
        }

        for (component, object_id, state) in entities::initial_states() {
            self.publish_state(component, object_id, state).await?;
        }

        tracing::info!(
            "Registered {} entities and {} events",
            configs.len(),
            events.len()
        );
        Ok(())
    }
}

/// Event payload: the event type plus its data, flattened.
fn event_payload(event_type: &str, data: Value) -> Value {
    let mut payload = serde_json::json!({"event_type": event_type});
    if let (Some(obj), Some(data_obj)) = (payload.as_object_mut(), data.as_object()) {
        for (key, value) in data_obj {
            obj.insert(key.clone(), value.clone());
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_payload_flattens_data() {
        let payload = event_payload("alert", json!({"description": "cat", "confidence": 0.9}));
        assert_eq!(payload["event_type"], "alert");
        assert_eq!(payload["description"], "cat");
        assert_eq!(payload["confidence"], 0.9);
    }

    #[test]
    fn test_event_payload_without_data_object() {
        let payload = event_payload("alert", Value::Null);
        assert_eq!(payload["event_type"], "alert");
    }
}
