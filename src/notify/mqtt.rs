use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Event, MqttOptions};
use rumqttc::Transport;

use super::{require_setting, AlertMessage, NotificationChannel};
use crate::config::MqttConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
struct MqttEndpoint {
    host: String,
    port: u16,
    use_tls: bool,
}

/// Publishes the alert as JSON on a broker topic for home-automation
/// consumers. Each delivery opens a short-lived session and waits for the
/// broker's PUBACK.
pub struct MqttChannel {
    endpoint: MqttEndpoint,
    topic: String,
    client_id: String,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

impl MqttChannel {
    pub fn new(cfg: &MqttConfig, timeout: Duration) -> Result<Self> {
        require_setting("mqtt", "broker_url", &cfg.broker_url)?;
        require_setting("mqtt", "topic", &cfg.topic)?;
        if cfg.topic.contains('#') || cfg.topic.contains('+') {
            return Err(anyhow!("mqtt channel: topic must not contain wildcards"));
        }
        if let Some(user) = &cfg.username {
            require_setting("mqtt", "username", user)?;
        }
        Ok(Self {
            endpoint: parse_broker_url(&cfg.broker_url)?,
            topic: cfg.topic.clone(),
            client_id: cfg.client_id.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            timeout,
        })
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);
        if let Some(user) = &self.username {
            options.set_credentials(user, self.password.clone().unwrap_or_default());
        }
        if self.endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

impl NotificationChannel for MqttChannel {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn deliver(&self, message: &AlertMessage) -> Result<()> {
        let payload = serde_json::to_vec(message).context("serialize alert payload")?;
        let (client, mut connection) = Client::new(self.options(), 10);
        client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .context("queue MQTT publish")?;

        let deadline = Instant::now() + self.timeout;
        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(anyhow!("timed out waiting for PUBACK from {}", self.endpoint.host));
            }
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::PubAck(_)))) => break Ok(()),
                Ok(Ok(_)) => {}
                Ok(Err(err)) => break Err(anyhow!("MQTT connection error: {}", err)),
                Err(_) => {
                    break Err(anyhow!("timed out waiting for PUBACK from {}", self.endpoint.host))
                }
            }
        };

        if let Err(err) = client.disconnect() {
            log::debug!("mqtt: disconnect failed: {}", err);
        }
        outcome
    }
}

fn parse_broker_url(raw: &str) -> Result<MqttEndpoint> {
    let parsed = url::Url::parse(raw.trim()).with_context(|| format!("invalid MQTT broker URL {}", raw))?;
    let use_tls = match parsed.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
    };
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("MQTT broker URL has no host: {}", raw))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = parsed.port().unwrap_or(if use_tls { 8883 } else { 1883 });
    Ok(MqttEndpoint { host, port, use_tls })
}
