use serde::{Deserialize, Serialize};

/// A batch of sensor readings produced by a single device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    /// The event's primary key.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// The time at which this event was pushed to an export destination.
    #[serde(skip_serializing_if = "is_zero")]
    pub pushed: i64,
    /// The name of the device which produced this event.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub created: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub modified: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub origin: i64,
    /// The readings of this event, in the order reported by the device.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub readings: Vec<Reading>,
    /// A content checksum, present when the event was published as an opaque payload.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

/// A single named value reported as part of an event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reading {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub pushed: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub created: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub modified: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub origin: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device: String,
    /// The value descriptor name of this reading.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// The string encoded value of this reading.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// The declared type of `value`, such as `Bool`, `Float64` or `String`.
    #[serde(rename = "valueType", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

fn is_zero(val: &i64) -> bool {
    *val == 0
}

#[cfg(test)]
impl Event {
    /// Build a test event for the given device with one reading per given name.
    pub fn new_test(device: &str, reading_names: &[&str]) -> Self {
        Self {
            id: format!("{}-event", device),
            device: device.into(),
            created: 1_600_000_000_000,
            modified: 1_600_000_000_001,
            origin: 1_600_000_000_002,
            readings: reading_names
                .iter()
                .enumerate()
                .map(|(idx, name)| Reading {
                    id: format!("{}-{}", device, idx),
                    device: device.into(),
                    name: (*name).into(),
                    value: format!("{}", idx as f64 + 0.5),
                    origin: 1_600_000_000_002,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}
