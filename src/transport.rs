//! MQTT transport glue — uplink ingest queue and downlink sink.
//!
//! The gateway network is reached through an MQTT broker. Inbound frames are
//! pushed onto a bounded channel consumed by the router loop, decoupling
//! broker delivery from processing and pacing. The core never touches the
//! broker directly; it sees the queue and the [`MeshSink`] trait.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::downlink::MeshSink;
use crate::error::TransportError;

/// MQTT broker configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic filter for the uplink subscription.
    pub root_filter: String,
    /// Region segment of the downlink topic.
    pub region: String,
    /// Firmware major version segment of the downlink topic.
    pub version: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            root_filter: "msh/#".to_string(),
            region: "EU".to_string(),
            version: "2".to_string(),
        }
    }
}

impl MeshConfig {
    /// Build config from environment variables, defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("MESH_MQTT_HOST").unwrap_or(defaults.host),
            port: std::env::var("MESH_MQTT_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            username: std::env::var("MESH_MQTT_USER").ok(),
            password: std::env::var("MESH_MQTT_PASS").ok(),
            root_filter: std::env::var("MESH_ROOT_FILTER").unwrap_or(defaults.root_filter),
            region: std::env::var("MESH_REGION").unwrap_or(defaults.region),
            version: std::env::var("MESH_VERSION").unwrap_or(defaults.version),
        }
    }

    /// Topic the gateway listens on for `sendtext` downlinks.
    pub fn downlink_topic(&self) -> String {
        format!("msh/{}/{}/json/mqtt/", self.region, self.version)
    }
}

/// One raw uplink frame, as delivered by the broker.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Downlink half of the transport.
pub struct MqttSink {
    client: AsyncClient,
    topic: String,
}

#[async_trait]
impl MeshSink for MqttSink {
    async fn publish(&self, payload: serde_json::Value) -> Result<(), TransportError> {
        let body = serde_json::to_vec(&payload)
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
        self.client
            .publish(self.topic.clone(), QoS::AtMostOnce, false, body)
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))
    }
}

/// Connect to the broker and spawn its event loop. Returns the downlink
/// sink, the uplink ingest queue, and the loop's task handle.
pub fn start(config: &MeshConfig) -> (MqttSink, mpsc::Receiver<RawPacket>, JoinHandle<()>) {
    let client_id = format!("meshdm-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        options.set_credentials(user.clone(), pass.clone());
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let (tx, rx) = mpsc::channel(256);

    let filter = config.root_filter.clone();
    let loop_client = client.clone();
    let handle = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // Runs on every (re)connect, restoring the subscription.
                    tracing::info!(filter = %filter, "MQTT connected, subscribing");
                    if let Err(e) = loop_client.subscribe(filter.clone(), QoS::AtMostOnce).await {
                        tracing::error!(error = %e, "MQTT subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let packet = RawPacket {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    };
                    if tx.send(packet).await.is_err() {
                        tracing::info!("ingest queue closed, stopping transport loop");
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "MQTT event loop error, retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });

    let sink = MqttSink {
        client,
        topic: config.downlink_topic(),
    };
    (sink, rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downlink_topic_shape() {
        let config = MeshConfig::default();
        assert_eq!(config.downlink_topic(), "msh/EU/2/json/mqtt/");

        let config = MeshConfig {
            region: "US".into(),
            version: "2".into(),
            ..MeshConfig::default()
        };
        assert_eq!(config.downlink_topic(), "msh/US/2/json/mqtt/");
    }

    #[test]
    fn default_broker_settings() {
        let config = MeshConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1883);
        assert_eq!(config.root_filter, "msh/#");
        assert!(config.username.is_none());
    }
}
