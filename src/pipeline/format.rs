use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{Event, ExportFormat};

/// The RFC 3339 rendering of an unset timestamp in Azure messages.
const AZURE_UNSET_TIME: &str = "0001-01-01T00:00:00Z";
/// The suffix appended to a device name to form a SenML base name.
const SENML_BASE_NAME_SUFFIX: &str = ".edgex-gateway";

/// A pipeline stage which renders an event into a wire payload.
///
/// An empty payload means there is nothing to send. Serialization failures are logged and
/// yield an empty payload.
pub trait Formatter: Send + Sync {
    fn format(&self, event: &Event) -> Vec<u8>;
}

/// Build the formatter of the given export format.
pub fn build_formatter(format: ExportFormat) -> Box<dyn Formatter> {
    match format {
        // IoT Core consumes the plain JSON rendering.
        ExportFormat::Json | ExportFormat::IotCoreJson => Box::new(JsonFormatter),
        ExportFormat::Xml => Box::new(XmlFormatter),
        ExportFormat::AzureJson => Box::new(AzureFormatter),
        ExportFormat::AwsJson => Box::new(AwsFormatter),
        ExportFormat::ThingsBoardJson => Box::new(ThingsBoardFormatter),
        ExportFormat::BiotJson => Box::new(BiotFormatter),
        ExportFormat::SenmlJson => Box::new(SenmlFormatter),
        ExportFormat::Noop => Box::new(NoopFormatter),
    }
}

/// Serialize the given value as JSON, logging and yielding nothing on failure.
fn to_json_or_empty<T: Serialize>(value: &T, kind: &str) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|err| {
        tracing::error!(error = ?err, kind, "error serializing event payload");
        Vec::new()
    })
}

pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format(&self, event: &Event) -> Vec<u8> {
        to_json_or_empty(event, "json")
    }
}

pub struct XmlFormatter;

impl Formatter for XmlFormatter {
    fn format(&self, event: &Event) -> Vec<u8> {
        match quick_xml::se::to_string_with_root("Event", event) {
            Ok(xml) => xml.into_bytes(),
            Err(err) => {
                tracing::error!(error = ?err, kind = "xml", "error serializing event payload");
                Vec::new()
            }
        }
    }
}

/// Renders events as Azure IoT Hub messages, carrying the JSON event as the message body.
pub struct AzureFormatter;

#[derive(Serialize)]
struct AzureAuthMethod {
    scope: String,
    #[serde(rename = "type")]
    kind: String,
    issuer: String,
}

#[derive(Serialize)]
struct AzureMessage {
    id: String,
    #[serde(rename = "sequenceNumber")]
    sequence_number: i64,
    #[serde(rename = "To")]
    to: String,
    #[serde(rename = "CreationTimeUtc")]
    created: String,
    #[serde(rename = "ExpiryTimeUtc")]
    expiry: String,
    #[serde(rename = "EnqueuedTime")]
    enqueued: String,
    #[serde(rename = "CorrelationId")]
    correlation_id: String,
    #[serde(rename = "userId")]
    user_id: String,
    /// The feedback code requested of the hub, `0` being none.
    ack: u8,
    #[serde(rename = "connectionDeviceId")]
    conn_device_id: String,
    #[serde(rename = "connectionDeviceGenerationId")]
    conn_device_gen_id: String,
    #[serde(rename = "connectionAuthMethod")]
    conn_auth_method: AzureAuthMethod,
    /// The base64 encoded JSON event.
    body: String,
    properties: BTreeMap<String, String>,
}

impl Formatter for AzureFormatter {
    fn format(&self, event: &Event) -> Vec<u8> {
        let body = to_json_or_empty(event, "azure body");
        if body.is_empty() {
            return body;
        }
        let created = match OffsetDateTime::now_utc().format(&Rfc3339) {
            Ok(created) => created,
            Err(err) => {
                tracing::error!(error = ?err, "error formatting azure message creation time");
                return Vec::new();
            }
        };
        let msg = AzureMessage {
            id: Uuid::new_v4().to_string(),
            sequence_number: 0,
            to: String::new(),
            created,
            expiry: AZURE_UNSET_TIME.into(),
            enqueued: AZURE_UNSET_TIME.into(),
            correlation_id: Uuid::new_v4().to_string(),
            user_id: event.origin.to_string(),
            ack: 0,
            conn_device_id: event.device.clone(),
            conn_device_gen_id: String::new(),
            conn_auth_method: AzureAuthMethod {
                scope: String::new(),
                kind: String::new(),
                issuer: String::new(),
            },
            body: base64::encode(&body),
            properties: BTreeMap::new(),
        };
        to_json_or_empty(&msg, "azure")
    }
}

/// Renders events as AWS IoT device shadow documents of reported state.
pub struct AwsFormatter;

impl Formatter for AwsFormatter {
    fn format(&self, event: &Event) -> Vec<u8> {
        let mut reported = serde_json::Map::new();
        for reading in event.readings.iter() {
            let value = match reading.value.parse::<f64>() {
                Ok(num) if num.is_finite() => json!(num),
                _ if reading.value.eq_ignore_ascii_case("true") => Value::Bool(true),
                _ if reading.value.eq_ignore_ascii_case("false") => Value::Bool(false),
                _ => Value::String(reading.value.clone()),
            };
            reported.insert(reading.name.clone(), value);
        }
        to_json_or_empty(&json!({"state": {"reported": reported}}), "aws")
    }
}

/// Renders events as ThingsBoard gateway telemetry keyed by device.
pub struct ThingsBoardFormatter;

#[derive(Serialize)]
struct ThingsBoardTelemetry<'a> {
    ts: i64,
    values: BTreeMap<&'a str, &'a str>,
}

impl Formatter for ThingsBoardFormatter {
    fn format(&self, event: &Event) -> Vec<u8> {
        let values = event.readings.iter().map(|r| (r.name.as_str(), r.value.as_str())).collect();
        let mut doc = BTreeMap::new();
        doc.insert(event.device.as_str(), vec![ThingsBoardTelemetry { ts: event.origin, values }]);
        to_json_or_empty(&doc, "thingsboard")
    }
}

/// Renders events as Brightics IoT messages, carrying the JSON event as message data.
pub struct BiotFormatter;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BiotMessage {
    version: String,
    msg_type: String,
    func_type: String,
    s_id: String,
    tp_id: String,
    t_id: String,
    msg_code: String,
    msg_id: String,
    msg_date: i64,
    res_code: String,
    res_msg: String,
    severity: String,
    #[serde(rename = "dataformat")]
    data_format: String,
    enc_type: String,
    auth_token: String,
    /// The base64 encoded JSON event.
    data: String,
}

impl Formatter for BiotFormatter {
    fn format(&self, event: &Event) -> Vec<u8> {
        let data = to_json_or_empty(event, "biot data");
        if data.is_empty() {
            return data;
        }
        let msg = BiotMessage {
            version: String::new(),
            msg_type: "Q".into(),
            func_type: String::new(),
            s_id: String::new(),
            tp_id: event.device.clone(),
            t_id: event.origin.to_string(),
            msg_code: String::new(),
            msg_id: Uuid::new_v4().to_string(),
            msg_date: (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
            res_code: String::new(),
            res_msg: String::new(),
            severity: "1".into(),
            data_format: String::new(),
            enc_type: String::new(),
            auth_token: String::new(),
            data: base64::encode(&data),
        };
        to_json_or_empty(&msg, "biot")
    }
}

/// Renders events as a SenML JSON pack with one record per reading.
pub struct SenmlFormatter;

#[derive(Debug, Default, PartialEq, Serialize)]
struct SenmlRecord {
    #[serde(rename = "bn", skip_serializing_if = "String::is_empty")]
    base_name: String,
    #[serde(rename = "n", skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(rename = "u", skip_serializing_if = "String::is_empty")]
    unit: String,
    #[serde(rename = "t", skip_serializing_if = "Option::is_none")]
    time: Option<f64>,
    #[serde(rename = "v", skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
    #[serde(rename = "vs", skip_serializing_if = "Option::is_none")]
    string_value: Option<String>,
    #[serde(rename = "vb", skip_serializing_if = "Option::is_none")]
    bool_value: Option<bool>,
}

impl SenmlFormatter {
    /// Decode a numeric reading value.
    ///
    /// Float values may arrive either as decimal text or as the base64 encoding of their
    /// big-endian IEEE 754 bits.
    fn numeric_value(value: &str, value_type: &str) -> Option<f64> {
        if let Ok(num) = value.parse::<f64>() {
            return Some(num);
        }
        if value_type != "Float64" {
            return None;
        }
        let bytes = base64::decode(value).ok()?;
        let bits: [u8; 8] = bytes.as_slice().try_into().ok()?;
        Some(f64::from_be_bytes(bits))
    }
}

impl Formatter for SenmlFormatter {
    fn format(&self, event: &Event) -> Vec<u8> {
        let records: Vec<SenmlRecord> = event
            .readings
            .iter()
            .map(|reading| {
                let mut record = SenmlRecord {
                    base_name: format!("{}{}", reading.device, SENML_BASE_NAME_SUFFIX),
                    name: reading.name.clone(),
                    unit: reading.unit.clone().unwrap_or_default(),
                    time: Some((reading.origin / 1000) as f64),
                    ..Default::default()
                };
                match reading.value_type.as_deref().unwrap_or("String") {
                    "Bool" => record.bool_value = reading.value.parse::<bool>().ok(),
                    kind @ ("Float32" | "Float64" | "Int8" | "Int16" | "Int32" | "Int64" | "Uint8" | "Uint16" | "Uint32" | "Uint64") => {
                        record.value = Self::numeric_value(&reading.value, kind);
                        if record.value.is_none() {
                            tracing::error!(reading = %reading.name, kind, "error decoding numeric SenML value");
                        }
                    }
                    _ => record.string_value = Some(reading.value.clone()),
                }
                record
            })
            .collect();
        to_json_or_empty(&records, "senml")
    }
}

/// Renders nothing, so no payload is ever sent.
pub struct NoopFormatter;

impl Formatter for NoopFormatter {
    fn format(&self, _: &Event) -> Vec<u8> {
        Vec::new()
    }
}
