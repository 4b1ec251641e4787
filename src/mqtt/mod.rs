use chrono::{DateTime, Utc};
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;

use crate::config::MqttConfig;
use crate::listeners::DeviceEvent;
use crate::models::{ConnectionState, Value};

/// Body published for every changed value
#[derive(Debug, Serialize)]
pub struct ValuePayload<'a> {
    #[serde(flatten)]
    pub value: &'a Value,
    pub time: DateTime<Utc>,
}

/// Body published, retained, whenever a device link changes state
#[derive(Debug, Serialize)]
pub struct StatePayload {
    pub state: ConnectionState,
    pub time: DateTime<Utc>,
}

/// Topic levels must not contain separators or wildcards
fn topic_level(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | '+' | '#' => '_',
            c => c,
        })
        .collect()
}

pub fn value_topic(base: &str, device: &str, identifier: &str) -> String {
    format!("{}/devs/{}/{}", base, topic_level(device), topic_level(identifier))
}

pub fn state_topic(base: &str, device: &str) -> String {
    format!("{}/devs/{}/state", base, topic_level(device))
}

/// Topic, payload and retain flag for one event
pub fn render_event(base: &str, event: &DeviceEvent) -> Result<(String, String, bool), serde_json::Error> {
    match event {
        DeviceEvent::ValueChanged { device, identifier, value, time } => {
            let payload = serde_json::to_string(&ValuePayload { value, time: *time })?;
            Ok((value_topic(base, device, identifier.as_str()), payload, false))
        }
        DeviceEvent::ConnectionStateChanged { device, state, time } => {
            let payload = serde_json::to_string(&StatePayload { state: *state, time: *time })?;
            Ok((state_topic(base, device), payload, true))
        }
    }
}

/// Publishes device events to an MQTT broker
pub struct MqttPublisher {
    client: AsyncClient,
    rx: Receiver<DeviceEvent>,
    base_topic: String,
    eventloop: JoinHandle<()>,
}

impl MqttPublisher {
    pub fn new(config: &MqttConfig, rx: Receiver<DeviceEvent>) -> Self {
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if let (Some(user), Some(pass)) = (&config.user, &config.pass) {
            mqttoptions.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
        let host = format!("{}:{}", config.host, config.port);

        let eventloop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker {}", host);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        MqttPublisher { client, rx, base_topic: config.base_topic.clone(), eventloop }
    }

    /// Publish until every event sender is gone
    pub async fn start_thread(mut self) {
        while let Some(event) = self.rx.recv().await {
            let (topic, payload, retain) = match render_event(&self.base_topic, &event) {
                Ok(rendered) => rendered,
                Err(e) => {
                    error!("Cannot serialize event of {}: {}", event.device(), e);
                    continue;
                }
            };

            match self.client.publish(topic.clone(), QoS::AtLeastOnce, retain, payload).await {
                Err(e) => error!("Error publishing to {}: {}", topic, e),
                Ok(_) => debug!("Published {}", topic),
            }
        }

        debug!("Event channel closed, disconnecting from MQTT");
        let _ = self.client.disconnect().await;
        // give the eventloop a moment to flush the disconnect
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.eventloop.abort();
    }
}
