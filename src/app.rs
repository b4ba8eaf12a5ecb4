use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::bus::MqttBus;
use crate::clients::{HttpEventAcker, HttpRegistrationStore};
use crate::config::{Config, ConfigSnapshot};
use crate::dispatcher::Dispatcher;
use crate::get_metrics_recorder;
use crate::sender::TransportFactory;
use crate::server::AppServer;

/// The application object for when the distro is running as a server.
pub struct App {
    /// The application's runtime config.
    config: ConfigSnapshot,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the message bus subscriber.
    bus_handle: JoinHandle<Result<()>>,
    /// The join handle of the dispatcher.
    dispatcher_handle: JoinHandle<Result<()>>,
    /// The join handle of the admin HTTP server.
    server_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_rx = BroadcastStream::new(shutdown_tx.subscribe());
        let snapshot = config.as_ref().clone().into_snapshot();

        let senders = Arc::new(TransportFactory::new()?);
        let store = Arc::new(HttpRegistrationStore::new(senders.client(), config.client_url.clone()));
        let acker = Arc::new(HttpEventAcker::new(senders.client(), config.data_url.clone()));

        let (bus, bus_rx, bus_errors_rx) = MqttBus::new(config.clone(), &shutdown_tx);
        let bus_handle = bus.spawn();

        let (dispatcher, dispatcher_tx) = Dispatcher::new(snapshot.clone(), store, acker, senders, bus_rx, bus_errors_rx, shutdown_tx.clone());
        let dispatcher_handle = dispatcher.spawn();

        let metrics = get_metrics_recorder(&config).handle();
        let (_addr, server_handle) = AppServer::new(config.http_port, dispatcher_tx, metrics, shutdown_tx.clone())
            .spawn()
            .context("error setting up admin HTTP server")?;

        Ok(Self {
            config: snapshot,
            shutdown_rx,
            shutdown_tx,
            bus_handle,
            dispatcher_handle,
            server_handle,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
        let mut reloads = SignalStream::new(signal(SignalKind::hangup()).context("error building signal stream")?);

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                Some(_) = reloads.next() => self.reload_config().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("export distro is shutting down");
        if let Err(err) = self.dispatcher_handle.await.context("error joining dispatcher handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down dispatcher");
        }
        if let Err(err) = self.bus_handle.await.context("error joining message bus handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down message bus subscriber");
        }
        if let Err(err) = self.server_handle.await.context("error joining admin server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down admin HTTP server");
        }

        tracing::debug!("export distro shutdown complete");
        Ok(())
    }

    /// Re-read the config from the environment, replacing the current snapshot.
    ///
    /// Only pipelines built after the reload observe the new config.
    async fn reload_config(&self) {
        match Config::load().await {
            Ok(config) => {
                self.config.store(Arc::new(config));
                tracing::info!("runtime config reloaded");
            }
            Err(err) => tracing::error!(error = ?err, "error reloading runtime config, keeping current config"),
        }
    }
}
