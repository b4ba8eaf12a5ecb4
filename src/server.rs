//! The admin HTTP server.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{rejection::JsonRejection, Extension};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, put};
use axum::{AddExtensionLayer, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::dispatcher::DispatcherHandle;
use crate::error::{AppError, AppErrorExt};
use crate::models::NotifyUpdate;

/// The admin HTTP server, serving health, registration notifications and metrics.
pub struct AppServer {
    port: u16,
    dispatcher: DispatcherHandle,
    metrics: PrometheusHandle,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Sender<()>,
}

impl AppServer {
    /// Create a new instance.
    pub fn new(port: u16, dispatcher: DispatcherHandle, metrics: PrometheusHandle, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            port,
            dispatcher,
            metrics,
            shutdown,
        }
    }

    /// Bind and spawn this server, yielding its bound address.
    ///
    /// A server error triggers a system shutdown.
    pub fn spawn(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let app = Router::new()
            .route("/api/v1/ping", get(ping))
            .route("/api/v1/notify/registrations", put(notify_registrations))
            .route("/metrics", get(prometheus_scrape))
            .layer(AddExtensionLayer::new(self.dispatcher))
            .layer(AddExtensionLayer::new(self.metrics));
        let mut shutdown_rx = self.shutdown.subscribe();
        let server = axum::Server::try_bind(&([0, 0, 0, 0], self.port).into())
            .context("error binding admin HTTP server")?
            .serve(app.into_make_service());
        let addr = server.local_addr();
        let server = server.with_graceful_shutdown(async move {
            let _res = shutdown_rx.recv().await;
        });
        tracing::info!(%addr, "admin HTTP server is listening");

        let shutdown = self.shutdown;
        Ok((
            addr,
            tokio::spawn(async move {
                let res = server.await.context("error from admin HTTP server");
                if res.is_err() {
                    let _res = shutdown.send(());
                }
                res
            }),
        ))
    }
}

async fn ping() -> &'static str {
    "pong"
}

/// Handle a registration change notification.
#[tracing::instrument(level = "debug", skip(dispatcher, payload))]
async fn notify_registrations(Extension(dispatcher): Extension<DispatcherHandle>, payload: Result<Json<NotifyUpdate>, JsonRejection>) -> (StatusCode, String) {
    let update = match payload {
        Ok(Json(update)) => update,
        Err(_) => return AppError::InvalidInput("malformed registration notification".into()).into_status(),
    };
    tracing::debug!(name = %update.name, operation = %update.operation, "received registration notification");
    match dispatcher.refresh_registrations(update) {
        Ok(()) => (StatusCode::OK, String::new()),
        Err(err) => {
            tracing::warn!(error = %err, "refusing registration notification");
            err.into_status()
        }
    }
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(Extension(state): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}
