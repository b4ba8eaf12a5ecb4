use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rumqttc::{AsyncClient, MqttOptions, QoS, TlsConfiguration, Transport};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use super::Sender;
use crate::config::{Config, PemFiles};
use crate::models::{Event, Registration};

/// The port of the AWS IoT MQTT broker.
const AWS_MQTT_PORT: u16 = 8883;
/// The default port of MQTT over TLS.
const MQTTS_PORT: u16 = 8883;
/// The lifetime of IoT Core connection tokens, in seconds.
const IOTCORE_TOKEN_TTL: i64 = 60 * 60 * 24;
/// The capacity of the request queue between a client and its event loop.
const CLIENT_CAPACITY: usize = 100;
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Paths of the PEM files used for a TLS connection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TlsFiles {
    pub ca: String,
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// Connection settings of an MQTT destination.
#[derive(Clone, Debug, PartialEq)]
pub struct MqttSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub username: Option<String>,
    /// The password, or the signing key path of a token when `token_audience` is set.
    pub password: Option<String>,
    pub tls: Option<TlsFiles>,
    /// When set, the password is an RS256 token for this audience, signed with the key at `password`.
    pub token_audience: Option<String>,
}

impl MqttSettings {
    /// Settings of a plain MQTT or Azure IoT Hub destination.
    ///
    /// TLS is used when the addressable's protocol is `tls`, `ssl` or `mqtts`.
    pub fn generic(config: &Config, reg: &Registration) -> Result<Self> {
        let addr = &reg.addressable;
        let tls = match addr.protocol.to_lowercase().as_str() {
            "tls" | "ssl" | "mqtts" => Some(TlsFiles {
                ca: config.mqtts_ca_file.clone().context("MQTTS_CA_FILE is required for MQTT over TLS")?,
                cert: config.mqtts_cert_file.clone(),
                key: config.mqtts_key_file.clone(),
            }),
            _ => None,
        };
        Ok(Self {
            client_id: client_id(reg),
            host: addr.address.clone(),
            port: if addr.port == 0 && tls.is_some() { MQTTS_PORT } else { addr.port },
            topic: addr.topic.clone(),
            username: non_empty(&addr.user),
            password: non_empty(&addr.password),
            tls,
            token_audience: None,
        })
    }

    /// Settings of an AWS IoT device shadow destination, where the topic names the thing.
    pub fn aws(config: &Config, reg: &Registration) -> Result<Self> {
        let addr = &reg.addressable;
        let tls = TlsFiles {
            ca: config.aws_ca_file.clone().context("AWS_CA_FILE is required for AWS destinations")?,
            cert: Some(config.aws_cert_file.clone().context("AWS_CERT_FILE is required for AWS destinations")?),
            key: Some(config.aws_key_file.clone().context("AWS_KEY_FILE is required for AWS destinations")?),
        };
        Ok(Self {
            client_id: client_id(reg),
            host: addr.address.clone(),
            port: AWS_MQTT_PORT,
            topic: format!("$aws/things/{}/shadow/update", addr.topic),
            username: None,
            password: None,
            tls: Some(tls),
            token_audience: None,
        })
    }

    /// Settings of a Google IoT Core destination.
    ///
    /// The publisher must be the full device path, `projects/{project}/locations/...`, and is
    /// used as the client ID. The project is the audience of the connection token.
    pub fn iotcore(config: &Config, reg: &Registration) -> Result<Self> {
        let addr = &reg.addressable;
        let project = iotcore_project(&addr.publisher).with_context(|| format!("invalid IoT Core device path '{}'", addr.publisher))?;
        let key = config.iotcore_key_file.clone().context("IOTCORE_KEY_FILE is required for IoT Core destinations")?;
        let tls = TlsFiles {
            ca: config.iotcore_ca_file.clone().context("IOTCORE_CA_FILE is required for IoT Core destinations")?,
            cert: None,
            key: None,
        };
        Ok(Self {
            client_id: addr.publisher.clone(),
            host: addr.address.clone(),
            port: if addr.port == 0 { MQTTS_PORT } else { addr.port },
            topic: addr.topic.clone(),
            username: Some("unused".into()),
            password: Some(key),
            tls: Some(tls),
            token_audience: Some(project),
        })
    }
}

fn client_id(reg: &Registration) -> String {
    if reg.addressable.publisher.is_empty() {
        format!("export-{}", reg.name)
    } else {
        reg.addressable.publisher.clone()
    }
}

fn non_empty(val: &str) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val.to_string())
    }
}

/// Extract the project of an IoT Core device path.
pub fn iotcore_project(device_path: &str) -> Option<String> {
    let mut segments = device_path.split('/');
    match (segments.next(), segments.next()) {
        (Some("projects"), Some(project)) if !project.is_empty() => Some(project.to_string()),
        _ => None,
    }
}

#[derive(Serialize)]
struct TokenClaims {
    iat: i64,
    exp: i64,
    aud: String,
}

/// Sign an RS256 connection token for the given audience.
fn sign_token(key_pem: &[u8], audience: &str) -> Result<String> {
    let iat = OffsetDateTime::now_utc().unix_timestamp();
    let claims = TokenClaims {
        iat,
        exp: iat + IOTCORE_TOKEN_TTL,
        aud: audience.to_string(),
    };
    let key = EncodingKey::from_rsa_pem(key_pem).context("error parsing IoT Core RSA key")?;
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key).context("error signing IoT Core token")
}

/// Publishes payloads to an MQTT topic.
pub struct MqttSender {
    client: AsyncClient,
    topic: String,
    /// The task driving the client's connection.
    eventloop: JoinHandle<()>,
}

impl MqttSender {
    /// Create a new instance, spawning the task which drives the connection.
    ///
    /// TLS and signing material is taken from the given PEM files, never read from disk here.
    pub fn new(settings: MqttSettings, pems: &PemFiles) -> Result<Self> {
        if settings.host.is_empty() {
            bail!("MQTT destination has no address");
        }
        if settings.topic.is_empty() {
            bail!("MQTT destination has no topic");
        }
        let mut opts = MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        opts.set_keep_alive(KEEP_ALIVE);

        let password = match (&settings.token_audience, &settings.password) {
            (Some(aud), Some(key_path)) => {
                let pem = pems.get(key_path)?;
                Some(sign_token(&pem, aud)?)
            }
            (_, password) => password.clone(),
        };
        if let Some(username) = &settings.username {
            opts.set_credentials(username.clone(), password.unwrap_or_default());
        }

        if let Some(tls) = &settings.tls {
            let ca = pems.get(&tls.ca)?.as_ref().clone();
            let client_auth = match (&tls.cert, &tls.key) {
                (Some(cert), Some(key)) => Some((pems.get(cert)?.as_ref().clone(), pems.get(key)?.as_ref().clone())),
                _ => None,
            };
            opts.set_transport(Transport::tls_with_config(TlsConfiguration::Simple { ca, alpn: None, client_auth }));
        }

        let (client, mut eventloop) = AsyncClient::new(opts, CLIENT_CAPACITY);
        let (host, port) = (settings.host, settings.port);
        let eventloop = tokio::spawn(async move {
            loop {
                if let Err(err) = eventloop.poll().await {
                    tracing::error!(error = ?err, %host, port, "MQTT destination connection error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });
        Ok(Self {
            client,
            topic: settings.topic,
            eventloop,
        })
    }
}

impl Drop for MqttSender {
    fn drop(&mut self) {
        self.eventloop.abort();
    }
}

#[async_trait]
impl Sender for MqttSender {
    #[tracing::instrument(level = "trace", skip(self, payload, _event), fields(topic = %self.topic))]
    async fn send(&self, payload: &[u8], _event: Option<&Event>) -> bool {
        match self.client.publish(self.topic.clone(), QoS::AtLeastOnce, false, payload.to_vec()).await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(error = ?err, topic = %self.topic, "error publishing payload to MQTT destination");
                false
            }
        }
    }
}
