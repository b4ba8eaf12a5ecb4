//! Clients of the services surrounding the distro: the registration store and core data.

#[cfg(test)]
mod mod_test;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};

use crate::models::Registration;

/// The system of record of export registrations.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Fetch all registrations.
    async fn get_all(&self) -> Result<Vec<Registration>>;
    /// Fetch the registration of the given name, if it exists.
    async fn get_by_name(&self, name: &str) -> Result<Option<Registration>>;
}

/// The acknowledgement callback informing core data that an event was exported.
#[async_trait]
pub trait EventAcker: Send + Sync {
    async fn mark_pushed(&self, event_id: &str) -> Result<()>;
    async fn mark_pushed_by_checksum(&self, checksum: &str) -> Result<()>;
}

/// Join path segments onto a base URL, percent-encoding each segment.
pub(crate) fn join_url(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid base URL '{}'", base))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("base URL '{}' can not carry a path", base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// A registration store client speaking the export client's REST API.
pub struct HttpRegistrationStore {
    client: Client,
    base_url: String,
}

impl HttpRegistrationStore {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RegistrationStore for HttpRegistrationStore {
    async fn get_all(&self) -> Result<Vec<Registration>> {
        let url = join_url(&self.base_url, &["api", "v1", "registration"])?;
        let response = self.client.get(url).send().await.context("error fetching registrations")?;
        if !response.status().is_success() {
            bail!("registration store responded with status {}", response.status());
        }
        response.json().await.context("error decoding registrations")
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Registration>> {
        let url = join_url(&self.base_url, &["api", "v1", "registration", "name", name])?;
        let response = self.client.get(url).send().await.context("error fetching registration")?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response.json().await.map(Some).context("error decoding registration"),
            status => bail!("registration store responded with status {}", status),
        }
    }
}

/// An acknowledgement client speaking core data's REST API.
pub struct HttpEventAcker {
    client: Client,
    base_url: String,
}

impl HttpEventAcker {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn put(&self, segments: &[&str]) -> Result<()> {
        let url = join_url(&self.base_url, segments)?;
        let response = self.client.put(url).send().await.context("error marking event as pushed")?;
        if !response.status().is_success() {
            bail!("core data responded with status {}", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl EventAcker for HttpEventAcker {
    async fn mark_pushed(&self, event_id: &str) -> Result<()> {
        self.put(&["api", "v1", "event", "id", event_id]).await
    }

    async fn mark_pushed_by_checksum(&self, checksum: &str) -> Result<()> {
        self.put(&["api", "v1", "event", "checksum", checksum]).await
    }
}
