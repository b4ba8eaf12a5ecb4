use anyhow::{Context, Result};
use serde_json::Value;

use super::format::*;
use crate::models::{Event, ExportFormat, Reading};

#[test]
fn json_formatter_round_trips_events() -> Result<()> {
    let formatter = build_formatter(ExportFormat::Json);

    let populated = Event::new_test("DEV1", &["temperature", "humidity"]);
    let output = formatter.format(&populated);
    let decoded: Event = serde_json::from_slice(&output).context("error decoding formatted event")?;
    assert_eq!(decoded, populated, "expected populated event to round trip through JSON");

    let empty = Event::default();
    let output = formatter.format(&empty);
    assert!(!output.is_empty(), "expected an empty event to still produce a JSON document");
    let decoded: Event = serde_json::from_slice(&output).context("error decoding formatted event")?;
    assert_eq!(decoded, empty, "expected default event to round trip through JSON");

    Ok(())
}

#[test]
fn iotcore_formatter_matches_json() {
    let event = Event::new_test("DEV1", &["temperature"]);
    assert_eq!(
        build_formatter(ExportFormat::IotCoreJson).format(&event),
        build_formatter(ExportFormat::Json).format(&event),
        "expected IoT Core output to be plain JSON"
    );
}

#[test]
fn noop_formatter_is_always_empty() {
    let formatter = build_formatter(ExportFormat::Noop);
    assert!(formatter.format(&Event::new_test("DEV1", &["temperature"])).is_empty());
    assert!(formatter.format(&Event::default()).is_empty());
}

#[test]
fn xml_formatter_renders_event_element() -> Result<()> {
    let output = build_formatter(ExportFormat::Xml).format(&Event::new_test("DEV1", &["temperature"]));
    let xml = String::from_utf8(output).context("expected XML output to be utf8")?;

    assert!(xml.starts_with("<Event>"), "expected XML root element to be Event, got {}", xml);
    assert!(xml.contains("<device>DEV1</device>"), "expected device element in {}", xml);
    assert!(xml.contains("<name>temperature</name>"), "expected reading name element in {}", xml);

    Ok(())
}

#[test]
fn aws_formatter_types_reported_values() -> Result<()> {
    let mut event = Event::new_test("DEV1", &["temperature", "enabled", "label"]);
    event.readings[1].value = "TRUE".into();
    event.readings[2].value = "kitchen".into();

    let output = build_formatter(ExportFormat::AwsJson).format(&event);
    let doc: Value = serde_json::from_slice(&output)?;
    let reported = &doc["state"]["reported"];

    assert_eq!(reported["temperature"], Value::from(0.5), "expected numeric reading as a number");
    assert_eq!(reported["enabled"], Value::Bool(true), "expected boolean reading as a bool");
    assert_eq!(reported["label"], Value::from("kitchen"), "expected other readings as strings");

    Ok(())
}

#[test]
fn thingsboard_formatter_groups_readings_by_device() -> Result<()> {
    let event = Event::new_test("DEV1", &["temperature", "humidity"]);

    let output = build_formatter(ExportFormat::ThingsBoardJson).format(&event);
    let doc: Value = serde_json::from_slice(&output)?;

    let telemetry = doc["DEV1"].as_array().context("expected an array of telemetry for DEV1")?;
    assert_eq!(telemetry.len(), 1, "expected a single telemetry entry");
    assert_eq!(telemetry[0]["ts"], Value::from(event.origin));
    assert_eq!(telemetry[0]["values"]["temperature"], Value::from("0.5"));
    assert_eq!(telemetry[0]["values"]["humidity"], Value::from("1.5"));

    Ok(())
}

#[test]
fn azure_formatter_wraps_event_as_body() -> Result<()> {
    let event = Event::new_test("DEV1", &["temperature"]);

    let output = build_formatter(ExportFormat::AzureJson).format(&event);
    let doc: Value = serde_json::from_slice(&output)?;

    assert_eq!(doc["connectionDeviceId"], Value::from("DEV1"));
    assert_eq!(doc["userId"], Value::from(event.origin.to_string()));
    assert_eq!(doc["ack"], Value::from(0));
    assert!(doc["id"].as_str().map(|id| !id.is_empty()).unwrap_or(false), "expected a message ID");
    assert_ne!(doc["id"], doc["CorrelationId"], "expected distinct message and correlation IDs");

    let body = base64::decode(doc["body"].as_str().context("expected a string body")?)?;
    let decoded: Event = serde_json::from_slice(&body)?;
    assert_eq!(decoded, event, "expected the body to carry the JSON event");

    Ok(())
}

#[test]
fn biot_formatter_wraps_event_as_data() -> Result<()> {
    let event = Event::new_test("DEV1", &["temperature"]);

    let output = build_formatter(ExportFormat::BiotJson).format(&event);
    let doc: Value = serde_json::from_slice(&output)?;

    assert_eq!(doc["msgType"], Value::from("Q"));
    assert_eq!(doc["severity"], Value::from("1"));
    assert_eq!(doc["tpId"], Value::from("DEV1"));
    assert_eq!(doc["tId"], Value::from(event.origin.to_string()));

    let data = base64::decode(doc["data"].as_str().context("expected string data")?)?;
    let decoded: Event = serde_json::from_slice(&data)?;
    assert_eq!(decoded, event, "expected data to carry the JSON event");

    Ok(())
}

#[test]
fn senml_formatter_renders_typed_records() -> Result<()> {
    let reading = |name: &str, value: String, value_type: &str| Reading {
        device: "DEV1".into(),
        name: name.into(),
        value,
        value_type: Some(value_type.into()),
        origin: 1_600_000_123_456,
        ..Default::default()
    };
    let event = Event {
        device: "DEV1".into(),
        readings: vec![
            reading("label", "kitchen".into(), "String"),
            reading("enabled", "true".into(), "Bool"),
            reading("temperature", base64::encode(21.5f64.to_be_bytes()), "Float64"),
            reading("count", "42".into(), "Int32"),
        ],
        ..Default::default()
    };

    let output = build_formatter(ExportFormat::SenmlJson).format(&event);
    let records: Value = serde_json::from_slice(&output)?;
    let records = records.as_array().context("expected a SenML pack array")?;

    assert_eq!(records.len(), 4, "expected one record per reading");
    assert_eq!(records[0]["bn"], Value::from("DEV1.edgex-gateway"));
    assert_eq!(records[0]["t"], Value::from(1_600_000_123.0));
    assert_eq!(records[0]["vs"], Value::from("kitchen"));
    assert_eq!(records[1]["vb"], Value::Bool(true));
    assert_eq!(records[2]["v"], Value::from(21.5));
    assert_eq!(records[3]["v"], Value::from(42.0));
    assert!(records[0].get("u").is_none(), "expected no unit to be rendered when absent");

    Ok(())
}
