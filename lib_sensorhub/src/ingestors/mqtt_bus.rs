//! # MQTT Bus Client
//!
//! Subscribes to the telemetry topic and forwards every publish into the
//! ingestion pipeline's channel. The `rumqttc` event loop reconnects on its
//! own after a failed poll; this module only paces the retries and keeps the
//! shared [`BusStatus`] flag in step with the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, Incoming, MqttOptions, QoS};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::ingestors::pipeline::BusMessage;

const DEFAULT_MQTT_PORT: u16 = 1883;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusConfigError {
    #[error("invalid broker URL '{0}': {1}")]
    InvalidUrl(String, String),

    #[error("unsupported broker scheme '{0}' (expected mqtt:// or tcp://)")]
    UnsupportedScheme(String),

    #[error("broker URL '{0}' has no host")]
    MissingHost(String),
}

/// Host, port and optional credentials taken from a broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
}

/// Parses `mqtt://[user:pass@]host[:port]`. `tcp://` is accepted as an
/// alias and the port defaults to 1883.
pub fn parse_broker_url(raw: &str) -> Result<BrokerAddress, BusConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| BusConfigError::InvalidUrl(raw.to_string(), e.to_string()))?;
    if !matches!(url.scheme(), "mqtt" | "tcp") {
        return Err(BusConfigError::UnsupportedScheme(url.scheme().to_string()));
    }
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| BusConfigError::MissingHost(raw.to_string()))?
        .to_string();
    let credentials = match (url.username(), url.password()) {
        ("", _) => None,
        (user, password) => Some((user.to_string(), password.unwrap_or_default().to_string())),
    };

    Ok(BrokerAddress {
        host,
        port: url.port().unwrap_or(DEFAULT_MQTT_PORT),
        credentials,
    })
}

/// Connection settings for the bus client.
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub broker_url: String,
    pub topic: String,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Overrides credentials embedded in `broker_url`.
    pub credentials: Option<(String, String)>,
}

impl BusSettings {
    pub fn mqtt_options(&self) -> Result<MqttOptions, BusConfigError> {
        let address = parse_broker_url(&self.broker_url)?;
        let mut options = MqttOptions::new(self.client_id.clone(), address.host, address.port);
        options.set_keep_alive(self.keep_alive);
        if let Some((user, password)) = self.credentials.clone().or(address.credentials) {
            options.set_credentials(user, password);
        }
        Ok(options)
    }
}

/// # Bus Status
///
/// Shared connectivity flag. Set on `CONNACK`, cleared on any poll error or
/// broker disconnect. Read by the status endpoint.
#[derive(Debug, Clone, Default)]
pub struct BusStatus {
    connected: Arc<AtomicBool>,
}

impl BusStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Stores the new state and returns the previous one.
    pub fn set_connected(&self, connected: bool) -> bool {
        self.connected.swap(connected, Ordering::AcqRel)
    }
}

/// Starts the bus client on the current runtime.
///
/// Fails only on invalid settings; connection problems are retried in the
/// background until `cancel` fires or the pipeline side of `sink` is dropped.
pub fn spawn_bus(
    settings: BusSettings,
    sink: mpsc::Sender<BusMessage>,
    status: BusStatus,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, BusConfigError> {
    let options = settings.mqtt_options()?;
    let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
    info!(broker = %settings.broker_url, topic = %settings.topic, client_id = %settings.client_id, "Starting MQTT client");
    Ok(tokio::spawn(run_event_loop(client, event_loop, settings.topic, sink, status, cancel)))
}

async fn run_event_loop(
    client: AsyncClient,
    mut event_loop: EventLoop,
    topic: String,
    sink: mpsc::Sender<BusMessage>,
    status: BusStatus,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("MQTT client received shutdown signal.");
                break;
            }
            polled = event_loop.poll() => match polled {
                Ok(MqttEvent::Incoming(Incoming::ConnAck(_))) => {
                    status.set_connected(true);
                    info!(topic = %topic, "Connected to MQTT broker");
                    // a fresh session may have lost its subscriptions
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        error!(topic = %topic, error = %e, "Failed to request subscription");
                    }
                }
                Ok(MqttEvent::Incoming(Incoming::SubAck(_))) => {
                    info!(topic = %topic, "Subscribed to MQTT topic");
                }
                Ok(MqttEvent::Incoming(Incoming::Publish(publish))) => {
                    let message = BusMessage::new(publish.topic, publish.payload);
                    if sink.send(message).await.is_err() {
                        warn!("Ingestion pipeline dropped its receiver. Stopping MQTT client.");
                        break;
                    }
                }
                Ok(MqttEvent::Incoming(Incoming::Disconnect)) => {
                    status.set_connected(false);
                    warn!("MQTT broker closed the session");
                }
                Ok(_) => {}
                Err(e) => {
                    if status.set_connected(false) {
                        warn!(error = %e, "MQTT connection lost; reconnecting");
                    } else {
                        debug!(error = %e, "MQTT connection attempt failed");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }

    status.set_connected(false);
    if let Err(e) = client.try_disconnect() {
        debug!(error = %e, "MQTT disconnect request not sent");
    }
    info!("MQTT client stopped.");
}
