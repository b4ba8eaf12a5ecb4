use async_trait::async_trait;
use reqwest::Client;

use super::Sender;
use crate::models::{Event, Reading, Registration};

/// Writes event readings into InfluxDB using the line protocol.
///
/// Only the structured path is supported, as readings are mapped onto points directly.
pub struct InfluxSender {
    client: Client,
    url: String,
    user: String,
    password: String,
}

impl InfluxSender {
    /// Create a new instance, where the addressable's path names the target database.
    pub fn new(client: Client, reg: &Registration) -> Self {
        let addr = &reg.addressable;
        let protocol = if addr.protocol.is_empty() { "http".to_string() } else { addr.protocol.to_lowercase() };
        let url = format!(
            "{}://{}:{}/write?db={}&precision=ms",
            protocol,
            addr.address,
            addr.port,
            addr.path.trim_matches('/')
        );
        Self {
            client,
            url,
            user: addr.user.clone(),
            password: addr.password.clone(),
        }
    }
}

/// Render the readings of an event as line protocol points, one per line.
pub fn to_line_protocol(event: &Event) -> String {
    event
        .readings
        .iter()
        .map(|reading| {
            let ts = if reading.origin != 0 { reading.origin } else { event.origin };
            let device = if reading.device.is_empty() { &event.device } else { &reading.device };
            format!("{},device={} value={} {}", escape_key(&reading.name), escape_key(device), field_value(reading), ts)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_key(val: &str) -> String {
    let mut out = String::with_capacity(val.len());
    for c in val.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn field_value(reading: &Reading) -> String {
    if reading.value.parse::<f64>().map(|v| v.is_finite()).unwrap_or(false) {
        return reading.value.clone();
    }
    match reading.value.to_lowercase().as_str() {
        "true" | "false" => reading.value.to_lowercase(),
        _ => format!("\"{}\"", reading.value.replace('\\', "\\\\").replace('"', "\\\"")),
    }
}

#[async_trait]
impl Sender for InfluxSender {
    #[tracing::instrument(level = "trace", skip(self, _payload, event), fields(url = %self.url))]
    async fn send(&self, _payload: &[u8], event: Option<&Event>) -> bool {
        let event = match event {
            Some(event) => event,
            None => {
                tracing::error!("raw payloads can not be written to InfluxDB");
                return false;
            }
        };
        if event.readings.is_empty() {
            tracing::debug!("event has no readings, nothing to write");
            return false;
        }
        let mut req = self.client.post(&self.url).body(to_line_protocol(event));
        if !self.user.is_empty() {
            req = req.basic_auth(&self.user, Some(&self.password));
        }
        match req.send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::error!(status = %response.status(), url = %self.url, "InfluxDB rejected write");
                false
            }
            Err(err) => {
                tracing::error!(error = ?err, url = %self.url, "error writing points to InfluxDB");
                false
            }
        }
    }
}
