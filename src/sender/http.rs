use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, Method};

use super::Sender;
use crate::models::{Addressable, Event, ExportFormat, Registration};

/// Delivers payloads to a REST endpoint.
pub struct HttpSender {
    client: Client,
    method: Method,
    url: String,
    content_type: &'static str,
}

impl HttpSender {
    /// Create a new instance for the given registration.
    ///
    /// The request method defaults to `POST`. XML formatted payloads are sent as
    /// `application/xml`, everything else as `application/json`.
    pub fn new(client: Client, reg: &Registration) -> Result<Self> {
        let method = if reg.addressable.method.is_empty() {
            Method::POST
        } else {
            Method::from_bytes(reg.addressable.method.to_uppercase().as_bytes())
                .with_context(|| format!("invalid HTTP method '{}'", reg.addressable.method))?
        };
        let content_type = match reg.format.parse::<ExportFormat>() {
            Ok(ExportFormat::Xml) => "application/xml",
            _ => "application/json",
        };
        Ok(Self {
            client,
            method,
            url: endpoint_url(&reg.addressable),
            content_type,
        })
    }
}

/// Build the URL of an addressable, as `{protocol}://{address}:{port}{path}`.
pub fn endpoint_url(addr: &Addressable) -> String {
    let protocol = if addr.protocol.is_empty() { "http" } else { addr.protocol.as_str() };
    let path = addr.path.trim_start_matches('/');
    format!("{}://{}:{}/{}", protocol.to_lowercase(), addr.address, addr.port, path)
}

#[async_trait]
impl Sender for HttpSender {
    #[tracing::instrument(level = "trace", skip(self, payload, _event), fields(url = %self.url))]
    async fn send(&self, payload: &[u8], _event: Option<&Event>) -> bool {
        let res = self
            .client
            .request(self.method.clone(), &self.url)
            .header(CONTENT_TYPE, self.content_type)
            .body(payload.to_vec())
            .send()
            .await;
        match res {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(status = %response.status(), "payload sent to REST endpoint");
                true
            }
            Ok(response) => {
                tracing::error!(status = %response.status(), url = %self.url, "REST endpoint rejected payload");
                false
            }
            Err(err) => {
                tracing::error!(error = ?err, url = %self.url, "error sending payload to REST endpoint");
                false
            }
        }
    }
}
