//! The export distro, fanning sensor events out to registered consumers.

mod app;
mod bus;
mod clients;
mod config;
mod dispatcher;
mod error;
#[cfg(test)]
mod fixtures;
mod metrics;
mod models;
mod pipeline;
mod registration;
mod sender;
mod server;

use std::io::Write;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::load().await?);
    let recorder = get_metrics_recorder(&cfg);
    ::metrics::set_recorder(recorder).context("error setting prometheus metrics recorder")?;
    crate::metrics::register_metrics();

    tracing::info!(
        rust_log = %cfg.rust_log,
        http_port = %cfg.http_port,
        bus_host = %cfg.bus_host,
        bus_topic = %cfg.bus_topic,
        client_url = %cfg.client_url,
        "starting export distro",
    );
    if let Err(err) = App::new(cfg)?.spawn().await.context("error joining app handle").and_then(|res| res) {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}

/// Get a handle to the metrics recorder, initializing it as needed.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    static RECORDER: OnceLock<PrometheusRecorder> = OnceLock::new();
    RECORDER.get_or_init(|| PrometheusBuilder::new().add_global_label("instance", config.bus_client_id.clone()).build())
}
