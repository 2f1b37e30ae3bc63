//! MQTT publisher built on `rumqttc`'s blocking v5 client.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use std::time::Duration;

use super::{FramePublisher, ImageMessage};

/// Broker endpoint parsed from `host:port`, `mqtt://host:port` or `tcp://host:port`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

pub fn parse_broker_addr(addr: &str) -> Result<BrokerAddr> {
    let mut remainder = addr.trim();
    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    if let Some(rest) = remainder.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok(BrokerAddr {
            host: host.to_string(),
            port,
        });
    }

    let (host, port) = remainder
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok(BrokerAddr {
        host: host.to_string(),
        port,
    })
}

/// Publishes each message to `<prefix>/rgb` or `<prefix>/grey`.
///
/// The connection's event loop is drained on a background thread; publishing only
/// queues the message.
pub struct MqttPublisher {
    client: Client,
    topic_prefix: String,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttPublisher {
    pub fn connect(addr: &str, client_id: &str, topic_prefix: &str) -> Result<Self> {
        let broker = parse_broker_addr(addr)?;
        let mut options = MqttOptions::new(client_id, &broker.host, broker.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);
        // Frames are large; raise the packet limit well above one RGB frame.
        options.set_max_packet_size(Some(64 * 1024 * 1024));

        let (client, connection) = Client::new(options, 4);
        let connection_handle = std::thread::Builder::new()
            .name("mqtt-connection".to_string())
            .spawn(move || drain_connection(connection))
            .context("spawn MQTT connection thread")?;
        log::info!(
            "MqttPublisher: publishing to {}:{} under '{}'",
            broker.host,
            broker.port,
            topic_prefix
        );
        Ok(Self {
            client,
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
            connection_handle: Some(connection_handle),
        })
    }

    pub fn topic_for(&self, message: &ImageMessage) -> String {
        format!("{}/{}", self.topic_prefix, message.encoding.topic_suffix())
    }
}

fn drain_connection(mut connection: Connection) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
            Err(e) => {
                log::warn!("MqttPublisher: connection error: {}", e);
                break;
            }
        }
    }
}

impl FramePublisher for MqttPublisher {
    fn publish(&mut self, message: &ImageMessage) -> Result<()> {
        let topic = self.topic_for(message);
        self.client
            .publish(topic, QoS::AtMostOnce, false, message.encode())
            .context("queue MQTT publish")?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.client.disconnect()?;
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}
