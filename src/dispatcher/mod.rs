//! The dispatcher of inbound bus messages.
//!
//! The dispatcher owns the set of live registration controllers, keyed by registration name.
//! Registration changes and bus messages both enter through its own loop, so the controller map
//! is never shared.


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::bus::BusMessage;
use crate::clients::{EventAcker, RegistrationStore};
use crate::config::ConfigSnapshot;
use crate::error::{AppError, ShutdownError, ShutdownResult};
use crate::metrics::{METRIC_EVENTS_DROPPED, METRIC_REGISTRATIONS_ACTIVE};
use crate::models::{NotifyOperation, NotifyUpdate, Registration};
use crate::pipeline::PipelineError;
use crate::registration::RegistrationHandle;
use crate::sender::SenderFactory;

/// Errors from handling a registration change.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("registration '{0}' already has a live controller")]
    AlreadyExists(String),
    #[error("registration '{0}' was not found in the registration store")]
    NotFound(String),
    #[error("registration '{0}' has no live controller")]
    NoLiveController(String),
    #[error("error querying registration store: {0:#}")]
    Store(anyhow::Error),
    #[error("error compiling registration: {0}")]
    Pipeline(#[from] PipelineError),
}

/// A validated registration change, bound for the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistrationChange {
    pub name: String,
    pub operation: NotifyOperation,
}

/// A handle for submitting registration changes to a running dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    changes_tx: mpsc::UnboundedSender<RegistrationChange>,
}

impl DispatcherHandle {
    #[cfg(test)]
    pub fn new_test() -> (Self, mpsc::UnboundedReceiver<RegistrationChange>) {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        (Self { changes_tx }, changes_rx)
    }

    /// Validate the given notification and enqueue it for the dispatcher.
    ///
    /// This never waits for the change to be applied.
    pub fn refresh_registrations(&self, update: NotifyUpdate) -> Result<(), AppError> {
        let operation = update.validate()?;
        self.changes_tx
            .send(RegistrationChange { name: update.name, operation })
            .map_err(|_| AppError::Ise(anyhow::anyhow!("dispatcher is no longer running")))
    }
}

/// The owner of all registration controllers.
pub struct Dispatcher {
    /// The runtime config snapshot, handed to every controller.
    config: ConfigSnapshot,
    store: Arc<dyn RegistrationStore>,
    acker: Arc<dyn EventAcker>,
    senders: Arc<dyn SenderFactory>,

    /// Messages from the bus.
    bus_rx: mpsc::Receiver<BusMessage>,
    /// Fatal errors from the bus.
    bus_errors_rx: mpsc::Receiver<ShutdownError>,
    /// Registration changes from the admin surface.
    changes_rx: mpsc::UnboundedReceiver<RegistrationChange>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// All live registration controllers.
    controllers: HashMap<String, RegistrationHandle>,
}

impl Dispatcher {
    /// Create a new instance, along with a handle for submitting registration changes.
    pub fn new(
        config: ConfigSnapshot, store: Arc<dyn RegistrationStore>, acker: Arc<dyn EventAcker>, senders: Arc<dyn SenderFactory>,
        bus_rx: mpsc::Receiver<BusMessage>, bus_errors_rx: mpsc::Receiver<ShutdownError>, shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, DispatcherHandle) {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                store,
                acker,
                senders,
                bus_rx,
                bus_errors_rx,
                changes_rx,
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
                shutdown_tx,
                controllers: Default::default(),
            },
            DispatcherHandle { changes_tx },
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let res = self.run_loop().await;

        tracing::debug!(controllers = self.controllers.len(), "dispatcher is shutting down");
        self.shutdown_controllers().await;
        if res.is_err() {
            let _ = self.shutdown_tx.send(());
        }
        tracing::debug!("dispatcher shutdown complete");
        res.context("fatal error in dispatcher")
    }

    async fn run_loop(&mut self) -> ShutdownResult<()> {
        let registrations = match self.load_registrations().await? {
            Some(registrations) => registrations,
            None => return Ok(()),
        };
        for registration in registrations {
            let name = registration.name.clone();
            if let Err(err) = self.spawn_controller(registration) {
                tracing::error!(error = %err, registration = %name, "error activating registration");
            }
        }
        tracing::info!(controllers = self.controllers.len(), "dispatcher initialized");

        loop {
            tokio::select! {
                biased;
                Some(err) = self.bus_errors_rx.recv() => return Err(err),
                _ = self.shutdown_rx.next() => return Ok(()),
                Some(change) = self.changes_rx.recv() => {
                    if let Err(err) = self.handle_change(&change).await {
                        tracing::error!(error = %err, registration = %change.name, operation = %change.operation, "error applying registration change");
                    }
                }
                Some(msg) = self.bus_rx.recv() => self.dispatch(msg).await,
            }
        }
    }

    /// Load all registrations, retrying while the store is unavailable.
    ///
    /// Yields `None` if shutdown was triggered before the store answered.
    async fn load_registrations(&mut self) -> ShutdownResult<Option<Vec<Registration>>> {
        loop {
            match self.store.get_all().await {
                Ok(registrations) => return Ok(Some(registrations)),
                Err(err) => tracing::error!(error = ?err, "error loading registrations, will retry"),
            }
            let interval = Duration::from_millis(self.config.load().store_retry_interval_ms);
            tokio::select! {
                _ = tokio::time::sleep(interval) => continue,
                Some(err) = self.bus_errors_rx.recv() => return Err(err),
                _ = self.shutdown_rx.next() => return Ok(None),
            }
        }
    }

    /// Apply a registration change.
    #[tracing::instrument(level = "debug", skip(self, change), fields(registration = %change.name, operation = %change.operation))]
    async fn handle_change(&mut self, change: &RegistrationChange) -> Result<(), DispatchError> {
        match change.operation {
            NotifyOperation::Add => {
                self.reap_if_pending(&change.name).await;
                if self.controllers.contains_key(&change.name) {
                    return Err(DispatchError::AlreadyExists(change.name.clone()));
                }
                let registration = self.lookup(&change.name).await?;
                self.spawn_controller(registration)?;
                tracing::info!("registration activated");
            }
            NotifyOperation::Update => {
                self.reap_if_pending(&change.name).await;
                if !self.controllers.contains_key(&change.name) {
                    return Err(DispatchError::NoLiveController(change.name.clone()));
                }
                let registration = Arc::new(self.lookup(&change.name).await?);
                let controller = self
                    .controllers
                    .get(&change.name)
                    .ok_or_else(|| DispatchError::NoLiveController(change.name.clone()))?;
                if controller.update(registration).is_err() {
                    self.reap(&change.name).await;
                    return Err(DispatchError::NoLiveController(change.name.clone()));
                }
                tracing::info!("registration update forwarded");
            }
            NotifyOperation::Delete => {
                let controller = self
                    .controllers
                    .remove(&change.name)
                    .ok_or_else(|| DispatchError::NoLiveController(change.name.clone()))?;
                // The controller may be blocked on its sender, so it is joined in the background.
                controller.delete();
                let name = change.name.clone();
                tokio::spawn(async move {
                    if let Err(err) = controller.join().await {
                        tracing::error!(error = ?err, registration = %name, "error shutting down registration controller");
                    }
                });
                self.record_active();
                tracing::info!("registration deactivated");
            }
        }
        Ok(())
    }

    /// Fetch a registration from the store.
    async fn lookup(&self, name: &str) -> Result<Registration, DispatchError> {
        self.store
            .get_by_name(name)
            .await
            .map_err(DispatchError::Store)?
            .ok_or_else(|| DispatchError::NotFound(name.into()))
    }

    /// Compile and spawn a controller for the given registration.
    fn spawn_controller(&mut self, registration: Registration) -> Result<(), DispatchError> {
        if self.controllers.contains_key(&registration.name) {
            return Err(DispatchError::AlreadyExists(registration.name));
        }
        let name = registration.name.clone();
        let handle = RegistrationHandle::spawn(Arc::new(registration), self.config.clone(), self.senders.clone(), self.acker.clone())?;
        self.controllers.insert(name, handle);
        self.record_active();
        Ok(())
    }

    /// Hand a bus message to every live controller, reaping controllers which have terminated.
    async fn dispatch(&mut self, msg: BusMessage) {
        let mut terminated = Vec::new();
        for (name, controller) in self.controllers.iter() {
            if controller.is_pending_deletion() {
                terminated.push(name.clone());
                continue;
            }
            match controller.try_dispatch(msg.clone()) {
                Ok(()) => (),
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(registration = %name, "registration queue is full, dropping message");
                    metrics::increment_counter!(METRIC_EVENTS_DROPPED, "registration" => name.to_string());
                }
                Err(TrySendError::Closed(_)) => terminated.push(name.clone()),
            }
        }
        for name in terminated {
            self.reap(&name).await;
        }
    }

    async fn reap_if_pending(&mut self, name: &str) {
        if self.controllers.get(name).map(|ctl| ctl.is_pending_deletion()).unwrap_or(false) {
            self.reap(name).await;
        }
    }

    /// Remove and join a controller which has terminated itself.
    async fn reap(&mut self, name: &str) {
        let controller = match self.controllers.remove(name) {
            Some(controller) => controller,
            None => return,
        };
        tracing::debug!(registration = %name, "reaping terminated registration controller");
        if let Err(err) = controller.join().await {
            tracing::error!(error = ?err, registration = %name, "error joining terminated registration controller");
        }
        self.record_active();
    }

    /// Stop every live controller, waiting a bounded time for all of them to finish.
    async fn shutdown_controllers(&mut self) {
        for controller in self.controllers.values().filter(|ctl| !ctl.is_pending_deletion()) {
            controller.delete();
        }
        let timeout = Duration::from_millis(self.config.load().controller_shutdown_timeout_ms);
        let joins = self.controllers.drain().map(|(name, controller)| async move {
            if let Err(err) = controller.join().await {
                tracing::error!(error = ?err, registration = %name, "error shutting down registration controller");
            }
        });
        if tokio::time::timeout(timeout, futures::future::join_all(joins)).await.is_err() {
            tracing::warn!(?timeout, "timeout while waiting for registration controllers to shutdown");
        }
        self.record_active();
    }

    fn record_active(&self) {
        metrics::gauge!(METRIC_REGISTRATIONS_ACTIVE, self.controllers.len() as f64);
    }
}
