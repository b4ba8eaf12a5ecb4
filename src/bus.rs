//! The inbound message bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::StreamExt;
use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, MqttOptions, Packet, QoS, SubscribeReasonCode};
use serde::{Deserialize, Deserializer};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::error::ShutdownError;
use crate::metrics::METRIC_EVENTS_RECEIVED;
use crate::models::Event;

/// The content type of structured events.
pub const CONTENT_TYPE_JSON: &str = "application/json";

const CLIENT_CAPACITY: usize = 100;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A message received from the bus.
#[derive(Clone, Debug)]
pub enum BusMessage {
    /// A structured event, run through the full pipeline.
    Event {
        event: Arc<Event>,
        correlation_id: String,
        content_type: String,
    },
    /// An opaque payload, sent as is.
    Raw { payload: Bytes, checksum: String, content_type: String },
}

/// The envelope wrapping every message published to the bus.
#[derive(Debug, Deserialize)]
struct MessageEnvelope {
    #[serde(rename = "Checksum", default)]
    checksum: String,
    #[serde(rename = "CorrelationID", default)]
    correlation_id: String,
    #[serde(rename = "Payload", default, deserialize_with = "deserialize_base64")]
    payload: Vec<u8>,
    #[serde(rename = "ContentType", default)]
    content_type: String,
}

fn deserialize_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    base64::decode(encoded).map_err(serde::de::Error::custom)
}

impl BusMessage {
    /// Decode a bus message from its envelope.
    ///
    /// JSON payloads, including those of envelopes without a content type, are parsed as
    /// events. Anything else is passed on as an opaque payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let envelope: MessageEnvelope = serde_json::from_slice(data).context("error decoding message envelope")?;
        let is_json = envelope.content_type.is_empty()
            || envelope
                .content_type
                .split(';')
                .next()
                .map(|mime| mime.trim().eq_ignore_ascii_case(CONTENT_TYPE_JSON))
                .unwrap_or(false);
        if !is_json {
            return Ok(BusMessage::Raw {
                payload: Bytes::from(envelope.payload),
                checksum: envelope.checksum,
                content_type: envelope.content_type,
            });
        }
        let event: Event = serde_json::from_slice(&envelope.payload).context("error decoding event payload")?;
        Ok(BusMessage::Event {
            event: Arc::new(event),
            correlation_id: envelope.correlation_id,
            content_type: if envelope.content_type.is_empty() {
                CONTENT_TYPE_JSON.into()
            } else {
                envelope.content_type
            },
        })
    }
}

/// An MQTT subscriber feeding bus messages to the dispatcher.
pub struct MqttBus {
    config: Arc<Config>,
    messages_tx: mpsc::Sender<BusMessage>,
    errors_tx: mpsc::Sender<ShutdownError>,
    shutdown_rx: BroadcastStream<()>,
}

impl MqttBus {
    /// Create a new instance, along with its channels of messages and of fatal errors.
    pub fn new(config: Arc<Config>, shutdown_tx: &broadcast::Sender<()>) -> (Self, mpsc::Receiver<BusMessage>, mpsc::Receiver<ShutdownError>) {
        let (messages_tx, messages_rx) = mpsc::channel(config.actor_queue_capacity);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        (
            Self {
                config,
                messages_tx,
                errors_tx,
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            },
            messages_rx,
            errors_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut opts = MqttOptions::new(self.config.bus_client_id.clone(), self.config.bus_host.clone(), self.config.bus_port);
        opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(opts, CLIENT_CAPACITY);
        tracing::info!(host = %self.config.bus_host, port = self.config.bus_port, topic = %self.config.bus_topic, "message bus subscriber started");

        loop {
            tokio::select! {
                res = eventloop.poll() => {
                    if let Err(err) = self.handle_event(&client, res).await {
                        let _ = self.errors_tx.send(err).await;
                        break;
                    }
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        let _ = client.try_disconnect();
        drain_disconnect(&mut eventloop).await;
        tracing::debug!("message bus subscriber has shutdown");
        Ok(())
    }

    /// Handle an event from the MQTT connection, returning an error only when it is fatal.
    async fn handle_event(&mut self, client: &AsyncClient, res: Result<MqttEvent, rumqttc::ConnectionError>) -> Result<(), ShutdownError> {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "message bus connection error");
                tokio::time::sleep(RECONNECT_DELAY).await;
                return Ok(());
            }
        };
        match event {
            // Sessions are clean, so every new connection needs a new subscription.
            MqttEvent::Incoming(Packet::ConnAck(_)) => {
                client
                    .try_subscribe(self.config.bus_topic.clone(), QoS::AtLeastOnce)
                    .context("error requesting message bus subscription")?;
            }
            MqttEvent::Incoming(Packet::SubAck(ack)) => {
                if ack.return_codes.iter().any(|code| matches!(code, SubscribeReasonCode::Failure)) {
                    return Err(ShutdownError(anyhow::anyhow!("message bus refused subscription to {}", self.config.bus_topic)));
                }
                tracing::debug!(topic = %self.config.bus_topic, "subscribed to message bus");
            }
            MqttEvent::Incoming(Packet::Publish(publish)) => {
                metrics::increment_counter!(METRIC_EVENTS_RECEIVED);
                match BusMessage::decode(&publish.payload) {
                    Ok(msg) => {
                        if self.messages_tx.send(msg).await.is_err() {
                            return Err(ShutdownError(anyhow::anyhow!("bus message receiver dropped")));
                        }
                    }
                    Err(err) => tracing::error!(error = ?err, topic = %publish.topic, "dropping undecodable bus message"),
                }
            }
            _ => (),
        }
        Ok(())
    }
}

/// Poll the event loop until the pending disconnect request has been flushed.
async fn drain_disconnect(eventloop: &mut EventLoop) {
    let drain = async {
        while let Ok(event) = eventloop.poll().await {
            if matches!(event, MqttEvent::Outgoing(rumqttc::Outgoing::Disconnect)) {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(1), drain).await;
}
