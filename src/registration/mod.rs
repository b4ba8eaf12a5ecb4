//! Registration controller.
//!
//! Each live registration is driven by its own controller task, which owns the compiled
//! pipeline of the registration and processes its inbound messages one at a time.


use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::bus::BusMessage;
use crate::clients::EventAcker;
use crate::config::ConfigSnapshot;
use crate::metrics::{METRIC_EVENTS_SENT, METRIC_SEND_FAILURES};
use crate::models::Registration;
use crate::pipeline::{Pipeline, PipelineError};
use crate::sender::SenderFactory;

/// A message bound for a registration controller's control queue.
#[derive(Debug)]
pub enum RegistrationCtlMsg {
    /// The registration was updated, and its pipeline must be rebuilt.
    Updated(Arc<Registration>),
    /// The registration was deleted, and its controller must stop.
    Deleted,
}

/// The dispatcher's handle to a live registration controller.
pub struct RegistrationHandle {
    data_tx: mpsc::Sender<BusMessage>,
    ctl_tx: mpsc::UnboundedSender<RegistrationCtlMsg>,
    handle: JoinHandle<Result<()>>,
}

impl RegistrationHandle {
    /// Compile the given registration and spawn its controller.
    ///
    /// No controller is spawned if the registration does not compile.
    pub fn spawn(
        registration: Arc<Registration>, config: ConfigSnapshot, senders: Arc<dyn SenderFactory>, acker: Arc<dyn EventAcker>,
    ) -> Result<Self, PipelineError> {
        let (ctl, data_tx, ctl_tx) = RegistrationCtl::new(registration, config, senders, acker)?;
        Ok(Self {
            data_tx,
            ctl_tx,
            handle: ctl.spawn(),
        })
    }

    /// Whether the controller has terminated itself and its handle must be reaped.
    pub fn is_pending_deletion(&self) -> bool {
        self.data_tx.is_closed()
    }

    /// Enqueue a bus message without waiting for queue capacity.
    pub fn try_dispatch(&self, msg: BusMessage) -> Result<(), TrySendError<BusMessage>> {
        self.data_tx.try_send(msg)
    }

    /// Hand an updated registration to the controller.
    pub fn update(&self, registration: Arc<Registration>) -> Result<()> {
        self.ctl_tx
            .send(RegistrationCtlMsg::Updated(registration))
            .map_err(|_| anyhow::anyhow!("registration controller has terminated"))
    }

    /// Tell the controller to stop, without waiting for it to finish.
    pub fn delete(&self) {
        let _ = self.ctl_tx.send(RegistrationCtlMsg::Deleted);
    }

    /// Wait for the controller task to finish.
    pub async fn join(self) -> Result<()> {
        self.handle.await.context("error joining registration controller handle").and_then(|res| res)
    }
}

/// A controller of a single registration.
pub struct RegistrationCtl {
    /// The name of the registration, which never changes for a controller.
    name: Arc<String>,
    /// The runtime config snapshot, loaded anew for every pipeline build.
    config: ConfigSnapshot,
    senders: Arc<dyn SenderFactory>,
    acker: Arc<dyn EventAcker>,
    /// The compiled pipeline of the current registration.
    pipeline: Pipeline,

    /// The queue of inbound bus messages.
    data_rx: mpsc::Receiver<BusMessage>,
    /// The queue of registration changes, which takes priority over bus messages.
    ctl_rx: mpsc::UnboundedReceiver<RegistrationCtlMsg>,
    /// A bool indicating that this controller has been deleted or invalidated and needs to shutdown.
    terminated: bool,
}

impl RegistrationCtl {
    /// Create a new instance along with the senders of its data and control queues.
    pub fn new(
        registration: Arc<Registration>, config: ConfigSnapshot, senders: Arc<dyn SenderFactory>, acker: Arc<dyn EventAcker>,
    ) -> Result<(Self, mpsc::Sender<BusMessage>, mpsc::UnboundedSender<RegistrationCtlMsg>), PipelineError> {
        let pipeline = Pipeline::build(&registration, &config.load(), senders.as_ref())?;
        let (data_tx, data_rx) = mpsc::channel(config.load().actor_queue_capacity);
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        tracing::debug!(registration = %registration.name, filters = pipeline.filter_count(), "registration pipeline compiled");
        Ok((
            Self {
                name: Arc::new(registration.name.clone()),
                config,
                senders,
                acker,
                pipeline,
                data_rx,
                ctl_rx,
                terminated: false,
            },
            data_tx,
            ctl_tx,
        ))
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(registration = %self.name, "registration controller has started");

        loop {
            if self.terminated {
                break;
            }
            tokio::select! {
                biased;
                msg_opt = self.ctl_rx.recv() => self.handle_ctl_msg(msg_opt),
                Some(msg) = self.data_rx.recv() => self.handle_bus_msg(msg).await,
            }
        }

        // Closing the queues flags this controller as pending deletion, and drops any
        // messages which are still queued.
        self.data_rx.close();
        self.ctl_rx.close();
        tracing::debug!(registration = %self.name, "registration controller has shutdown");
        Ok(())
    }

    /// Handle a message from the control queue.
    #[tracing::instrument(level = "debug", skip(self, msg_opt), fields(registration = %self.name))]
    fn handle_ctl_msg(&mut self, msg_opt: Option<RegistrationCtlMsg>) {
        let registration = match msg_opt {
            Some(RegistrationCtlMsg::Updated(registration)) => registration,
            Some(RegistrationCtlMsg::Deleted) | None => {
                self.terminated = true;
                return;
            }
        };
        match Pipeline::build(&registration, &self.config.load(), self.senders.as_ref()) {
            Ok(pipeline) => {
                tracing::info!(filters = pipeline.filter_count(), enabled = pipeline.enabled(), "registration pipeline rebuilt");
                self.pipeline = pipeline;
            }
            Err(err) => {
                tracing::error!(error = %err, "error rebuilding registration pipeline, terminating controller");
                self.terminated = true;
            }
        }
    }

    /// Run a bus message through the pipeline.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(registration = %self.name))]
    async fn handle_bus_msg(&mut self, msg: BusMessage) {
        if !self.pipeline.enabled() {
            return;
        }
        match msg {
            BusMessage::Event { event, .. } => {
                let event = match self.pipeline.filter(event) {
                    Some(event) => event,
                    None => return,
                };
                let payload = match self.pipeline.encode(&event) {
                    Some(payload) => payload,
                    None => return,
                };
                let sent = self.pipeline.send(&payload, Some(&event)).await;
                self.record_send(sent);
                if sent && self.pipeline.mark_pushed() {
                    self.ack(Ack::EventId(event.id.clone()));
                }
            }
            BusMessage::Raw { payload, checksum, .. } => {
                let sent = self.pipeline.send(&payload, None).await;
                self.record_send(sent);
                if sent && self.pipeline.mark_pushed() {
                    self.ack(Ack::Checksum(checksum));
                }
            }
        }
    }

    fn record_send(&self, sent: bool) {
        if sent {
            metrics::increment_counter!(METRIC_EVENTS_SENT, "registration" => self.name.to_string());
        } else {
            tracing::error!(registration = %self.name, "export destination did not accept payload");
            metrics::increment_counter!(METRIC_SEND_FAILURES, "registration" => self.name.to_string());
        }
    }

    /// Acknowledge a delivered message in the background.
    fn ack(&self, ack: Ack) {
        let key = match &ack {
            Ack::EventId(key) | Ack::Checksum(key) => key,
        };
        if key.is_empty() {
            tracing::debug!(registration = %self.name, "delivered message has no identity, skipping mark pushed");
            return;
        }
        let acker = self.acker.clone();
        tokio::spawn(async move {
            let res = match &ack {
                Ack::EventId(id) => acker.mark_pushed(id).await,
                Ack::Checksum(checksum) => acker.mark_pushed_by_checksum(checksum).await,
            };
            if let Err(err) = res {
                tracing::error!(error = ?err, "error marking event as pushed");
            }
        });
    }
}

/// The identity under which a delivered message is acknowledged.
enum Ack {
    EventId(String),
    Checksum(String),
}
