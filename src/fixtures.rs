use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use axum::extract::{Extension, Path};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::routing::{get, post, put};
use axum::{AddExtensionLayer, Json, Router};
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::clients::{EventAcker, RegistrationStore};
use crate::config::Config;
use crate::models::{Addressable, Destination, Event, Filter, Registration};
use crate::sender::{Sender, SenderFactory};

/// Build an enabled JSON registration delivering over REST, filtered on the given devices.
pub fn registration(name: &str, devices: &[&str]) -> Registration {
    Registration {
        name: name.into(),
        format: "JSON".into(),
        destination: "REST_ENDPOINT".into(),
        enable: true,
        addressable: Addressable {
            name: format!("{}-addressable", name),
            protocol: "http".into(),
            address: "localhost".into(),
            port: 8080,
            path: "/ingest".into(),
            ..Default::default()
        },
        filter: Filter {
            device_ids: devices.iter().map(|dev| dev.to_string()).collect(),
            value_descriptor_ids: vec![],
        },
        ..Default::default()
    }
}

/// An in-memory registration store, which can be told to fail.
pub struct MemoryStore {
    regs: Mutex<HashMap<String, Registration>>,
    failures: AtomicUsize,
}

impl MemoryStore {
    pub fn new(regs: Vec<Registration>) -> Arc<Self> {
        Arc::new(Self {
            regs: Mutex::new(regs.into_iter().map(|reg| (reg.name.clone(), reg)).collect()),
            failures: AtomicUsize::new(0),
        })
    }

    /// Fail the next `count` calls to the store.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn put(&self, reg: Registration) {
        self.regs.lock().expect("store lock poisoned").insert(reg.name.clone(), reg);
    }

    fn check_failure(&self) -> Result<()> {
        let prev = self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |val| val.checked_sub(1));
        if prev.is_ok() {
            bail!("store is unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl RegistrationStore for MemoryStore {
    async fn get_all(&self) -> Result<Vec<Registration>> {
        self.check_failure()?;
        let mut regs: Vec<_> = self.regs.lock().map_err(|_| anyhow!("store lock poisoned"))?.values().cloned().collect();
        regs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(regs)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Registration>> {
        self.check_failure()?;
        Ok(self.regs.lock().map_err(|_| anyhow!("store lock poisoned"))?.get(name).cloned())
    }
}

/// A payload observed by a recording sender.
#[derive(Clone, Debug)]
pub struct Sent {
    pub registration: String,
    pub payload: Vec<u8>,
    pub event: Option<Event>,
}

/// A sender which records everything it is given.
pub struct RecordingSender {
    registration: String,
    tx: mpsc::UnboundedSender<Sent>,
    succeed: Arc<AtomicBool>,
    /// Never complete a send once it is recorded.
    stall: bool,
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send(&self, payload: &[u8], event: Option<&Event>) -> bool {
        // Load the outcome first, so that observers of the record may change it for later sends.
        let succeed = self.succeed.load(Ordering::SeqCst);
        let _ = self.tx.send(Sent {
            registration: self.registration.clone(),
            payload: payload.to_vec(),
            event: event.cloned(),
        });
        if self.stall {
            futures::future::pending::<()>().await;
        }
        succeed
    }
}

/// A sender factory building recording senders, refusing the same destinations as the real one.
pub struct RecordingFactory {
    tx: mpsc::UnboundedSender<Sent>,
    succeed: Arc<AtomicBool>,
    builds: AtomicUsize,
    stalled: Mutex<HashSet<String>>,
}

impl RecordingFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Sent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Arc::new(Self {
            tx,
            succeed: Arc::new(AtomicBool::new(true)),
            builds: AtomicUsize::new(0),
            stalled: Mutex::new(HashSet::new()),
        });
        (factory, rx)
    }

    /// Set whether senders report success, including already built senders.
    pub fn set_succeed(&self, succeed: bool) {
        self.succeed.store(succeed, Ordering::SeqCst);
    }

    /// Make senders built from now on for the given registration stall on every send.
    pub fn stall(&self, registration: &str) {
        self.stalled.lock().expect("stalled lock poisoned").insert(registration.into());
    }

    /// The number of senders built so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl SenderFactory for RecordingFactory {
    fn build(&self, _: &Config, reg: &Registration, dest: Destination) -> Result<Arc<dyn Sender>> {
        if matches!(dest, Destination::Zmq | Destination::Xmpp) {
            bail!("no sender is available for destination {}", dest);
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        let stall = self.stalled.lock().map_err(|_| anyhow!("stalled lock poisoned"))?.contains(&reg.name);
        Ok(Arc::new(RecordingSender {
            registration: reg.name.clone(),
            tx: self.tx.clone(),
            succeed: self.succeed.clone(),
            stall,
        }))
    }
}

/// An acknowledgement observed by a recording acker.
#[derive(Clone, Debug, PartialEq)]
pub enum Ack {
    Id(String),
    Checksum(String),
}

/// An event acker which records every acknowledgement.
pub struct RecordingAcker {
    tx: mpsc::UnboundedSender<Ack>,
}

impl RecordingAcker {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Ack>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl EventAcker for RecordingAcker {
    async fn mark_pushed(&self, event_id: &str) -> Result<()> {
        self.tx.send(Ack::Id(event_id.into())).context("ack receiver dropped")
    }

    async fn mark_pushed_by_checksum(&self, checksum: &str) -> Result<()> {
        self.tx.send(Ack::Checksum(checksum.into())).context("ack receiver dropped")
    }
}

/// A request observed by an HTTP recorder.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub content_type: String,
    pub authorization: String,
    pub body: Vec<u8>,
}

struct RecorderState {
    tx: mpsc::UnboundedSender<RecordedRequest>,
    status: StatusCode,
}

/// Spawn an HTTP server which records requests to the export and acknowledgement endpoints,
/// answering each with the given status.
pub async fn spawn_http_recorder(status: u16) -> Result<(SocketAddr, mpsc::UnboundedReceiver<RecordedRequest>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let status = StatusCode::from_u16(status).context("invalid status code")?;
    let app = Router::new()
        .route("/ingest", post(record_request).put(record_request))
        .route("/write", post(record_request))
        .route("/api/v1/event/id/:id", put(record_request))
        .route("/api/v1/event/checksum/:checksum", put(record_request))
        .layer(AddExtensionLayer::new(Arc::new(RecorderState { tx, status })));
    let server = axum::Server::try_bind(&([127, 0, 0, 1], 0).into())?.serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    Ok((addr, rx))
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers.get(name).and_then(|val| val.to_str().ok()).unwrap_or_default().to_string()
}

async fn record_request(Extension(state): Extension<Arc<RecorderState>>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> StatusCode {
    let _ = state.tx.send(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().unwrap_or_default().to_string(),
        content_type: header_str(&headers, header::CONTENT_TYPE),
        authorization: header_str(&headers, header::AUTHORIZATION),
        body: body.to_vec(),
    });
    state.status
}

/// Spawn an HTTP server serving the given registrations like the export client does.
pub async fn spawn_store_server(regs: Vec<Registration>) -> Result<SocketAddr> {
    let app = Router::new()
        .route("/api/v1/registration", get(list_registrations))
        .route("/api/v1/registration/name/:name", get(get_registration))
        .layer(AddExtensionLayer::new(Arc::new(regs)));
    let server = axum::Server::try_bind(&([127, 0, 0, 1], 0).into())?.serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    Ok(addr)
}

async fn list_registrations(Extension(regs): Extension<Arc<Vec<Registration>>>) -> Json<Vec<Registration>> {
    Json(regs.as_ref().clone())
}

async fn get_registration(Path(name): Path<String>, Extension(regs): Extension<Arc<Vec<Registration>>>) -> Result<Json<Registration>, StatusCode> {
    regs.iter().find(|reg| reg.name == name).cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
}
