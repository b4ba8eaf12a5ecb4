//! Runtime configuration.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::Deserialize;

/// A swappable snapshot of the runtime config.
///
/// Pipelines are built against whichever config is current at build time. Replacing the
/// snapshot does not affect already built pipelines.
pub type ConfigSnapshot = Arc<ArcSwap<Config>>;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// The port of the admin HTTP server.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The base URL of the registration store.
    #[serde(default = "Config::default_client_url")]
    pub client_url: String,
    /// The base URL of core data, used for marking events as pushed.
    #[serde(default = "Config::default_data_url")]
    pub data_url: String,
    /// Whether successfully exported events are marked as pushed by default.
    ///
    /// Registrations may override this with their own `markPushed` option.
    #[serde(default)]
    pub mark_pushed: bool,

    /// The host of the MQTT message bus on which events arrive.
    #[serde(default = "Config::default_bus_host")]
    pub bus_host: String,
    /// The port of the MQTT message bus.
    #[serde(default = "Config::default_bus_port")]
    pub bus_port: u16,
    /// The message bus topic carrying events.
    #[serde(default = "Config::default_bus_topic")]
    pub bus_topic: String,
    /// The client ID used when subscribing to the message bus.
    #[serde(default = "Config::default_bus_client_id")]
    pub bus_client_id: String,

    /// The interval in milliseconds at which the registration store is polled during startup.
    #[serde(default = "Config::default_store_retry_interval_ms")]
    pub store_retry_interval_ms: u64,
    /// The capacity of each registration's inbound data queue.
    #[serde(default = "Config::default_actor_queue_capacity")]
    pub actor_queue_capacity: usize,
    /// The time in milliseconds given to registration controllers to finish during shutdown.
    #[serde(default = "Config::default_controller_shutdown_timeout_ms")]
    pub controller_shutdown_timeout_ms: u64,

    /// PEM CA bundle used by MQTT and Azure destinations over TLS.
    pub mqtts_ca_file: Option<String>,
    /// PEM client certificate used by MQTT and Azure destinations over TLS.
    pub mqtts_cert_file: Option<String>,
    /// PEM client key used by MQTT and Azure destinations over TLS.
    pub mqtts_key_file: Option<String>,
    /// PEM CA bundle used by AWS IoT destinations.
    pub aws_ca_file: Option<String>,
    /// PEM client certificate used by AWS IoT destinations.
    pub aws_cert_file: Option<String>,
    /// PEM client key used by AWS IoT destinations.
    pub aws_key_file: Option<String>,
    /// PEM CA bundle used by Google IoT Core destinations.
    pub iotcore_ca_file: Option<String>,
    /// PEM RSA key used to sign IoT Core connection tokens.
    pub iotcore_key_file: Option<String>,

    /// The contents of the PEM files above, read once when the config is loaded.
    #[serde(skip)]
    pub pem_files: PemFiles,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Create a new config instance, along with the contents of the PEM files it names.
    pub async fn load() -> Result<Self> {
        let mut config = Self::new()?;
        config.pem_files = PemFiles::load(config.pem_paths()).await;
        Ok(config)
    }

    /// The paths of all PEM files named by this config.
    pub fn pem_paths(&self) -> impl Iterator<Item = &str> {
        [
            &self.mqtts_ca_file,
            &self.mqtts_cert_file,
            &self.mqtts_key_file,
            &self.aws_ca_file,
            &self.aws_cert_file,
            &self.aws_key_file,
            &self.iotcore_ca_file,
            &self.iotcore_key_file,
        ]
        .into_iter()
        .filter_map(|path| path.as_deref())
    }

    /// Wrap this config in a swappable snapshot.
    pub fn into_snapshot(self) -> ConfigSnapshot {
        Arc::new(ArcSwap::from_pointee(self))
    }

    fn validate(&self) -> Result<()> {
        if self.actor_queue_capacity == 0 {
            anyhow::bail!("ACTOR_QUEUE_CAPACITY must be greater than 0");
        }
        if self.bus_topic.is_empty() {
            anyhow::bail!("BUS_TOPIC must not be empty");
        }
        Ok(())
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_http_port() -> u16 {
        48070
    }

    fn default_client_url() -> String {
        "http://localhost:48071".into()
    }

    fn default_data_url() -> String {
        "http://localhost:48080".into()
    }

    fn default_bus_host() -> String {
        "localhost".into()
    }

    fn default_bus_port() -> u16 {
        1883
    }

    fn default_bus_topic() -> String {
        "events".into()
    }

    fn default_bus_client_id() -> String {
        "export-distro".into()
    }

    fn default_store_retry_interval_ms() -> u64 {
        1000
    }

    fn default_actor_queue_capacity() -> usize {
        1000
    }

    fn default_controller_shutdown_timeout_ms() -> u64 {
        10_000
    }
}

/// PEM material keyed by the path it was read from.
///
/// Files which could not be read are absent, which fails the build of any sender needing them.
#[derive(Clone, Debug, Default)]
pub struct PemFiles(HashMap<String, Arc<Vec<u8>>>);

impl PemFiles {
    /// Read each of the given files, logging those which can not be read.
    pub async fn load<'a>(paths: impl Iterator<Item = &'a str>) -> Self {
        let mut files = HashMap::new();
        for path in paths {
            match tokio::fs::read(path).await {
                Ok(pem) => {
                    files.insert(path.to_string(), Arc::new(pem));
                }
                Err(err) => tracing::error!(error = ?err, path, "error reading PEM file"),
            }
        }
        Self(files)
    }

    /// Get the contents of the PEM file at the given path.
    pub fn get(&self, path: &str) -> Result<Arc<Vec<u8>>> {
        self.0.get(path).cloned().with_context(|| format!("PEM file {} is not loaded", path))
    }

    #[cfg(test)]
    pub fn insert(&mut self, path: &str, pem: &[u8]) {
        self.0.insert(path.into(), Arc::new(pem.to_vec()));
    }
}

#[cfg(test)]
impl Config {
    /// Create a config for use in tests, with a short store retry interval.
    pub fn new_test() -> Result<Arc<Self>> {
        let mut config: Config = envy::from_iter(Vec::<(String, String)>::new()).context("error building test config")?;
        config.store_retry_interval_ms = 10;
        config.actor_queue_capacity = 100;
        config.controller_shutdown_timeout_ms = 200;
        Ok(Arc::new(config))
    }
}
