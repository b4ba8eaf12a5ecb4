//! Export destination transports.

mod http;
mod influx;
mod mqtt;
#[cfg(test)]
mod mqtt_test;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::Config;
use crate::models::{Destination, Event, Registration};

pub use http::HttpSender;
pub use influx::InfluxSender;
pub use mqtt::{MqttSender, MqttSettings};

/// A transport delivering payloads to one export destination.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Send the given payload, returning `true` only if the destination accepted it.
    ///
    /// The event is given on the structured path, for transports which map readings themselves.
    async fn send(&self, payload: &[u8], event: Option<&Event>) -> bool;
}

/// A factory of senders for registrations.
pub trait SenderFactory: Send + Sync {
    /// Build the sender of the given registration's destination.
    fn build(&self, config: &Config, reg: &Registration, dest: Destination) -> Result<Arc<dyn Sender>>;
}

/// The sender factory backed by the real network transports.
#[derive(Clone)]
pub struct TransportFactory {
    client: reqwest::Client,
}

impl TransportFactory {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("error building HTTP client")?;
        Ok(Self { client })
    }

    /// The HTTP client shared by all HTTP based senders.
    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }
}

impl SenderFactory for TransportFactory {
    fn build(&self, config: &Config, reg: &Registration, dest: Destination) -> Result<Arc<dyn Sender>> {
        Ok(match dest {
            Destination::Rest => Arc::new(HttpSender::new(self.client.clone(), reg)?),
            Destination::InfluxDb => Arc::new(InfluxSender::new(self.client.clone(), reg)),
            Destination::Mqtt | Destination::AzureMqtt => Arc::new(MqttSender::new(MqttSettings::generic(config, reg)?, &config.pem_files)?),
            Destination::AwsMqtt => Arc::new(MqttSender::new(MqttSettings::aws(config, reg)?, &config.pem_files)?),
            Destination::IotCoreMqtt => Arc::new(MqttSender::new(MqttSettings::iotcore(config, reg)?, &config.pem_files)?),
            Destination::Zmq | Destination::Xmpp => bail!("no sender is available for destination {}", dest),
        })
    }
}
