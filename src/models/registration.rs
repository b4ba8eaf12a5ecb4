use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// An export registration, describing how one external consumer wants to receive events.
///
/// Enum-valued fields are kept as strings here. They are resolved into their typed
/// counterparts when a pipeline is built, so that an unknown value fails the pipeline build
/// of the one registration instead of failing to decode the whole registration set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Registration {
    pub id: String,
    pub created: i64,
    pub modified: i64,
    pub origin: i64,
    /// The unique name of this registration.
    pub name: String,
    /// Addressing info of the export destination.
    pub addressable: Addressable,
    /// The wire format of exported events.
    pub format: String,
    pub filter: Filter,
    pub encryption: EncryptionDetails,
    pub compression: String,
    pub enable: bool,
    /// The transport used to deliver exported events.
    pub destination: String,
    /// Acknowledge successful deliveries back to core data.
    ///
    /// When absent, the service wide `MARK_PUSHED` default applies.
    #[serde(rename = "markPushed", skip_serializing_if = "Option::is_none")]
    pub mark_pushed: Option<bool>,
}

/// Addressing info of an export destination.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Addressable {
    pub name: String,
    pub protocol: String,
    /// The HTTP method used by REST destinations.
    pub method: String,
    pub address: String,
    pub port: u16,
    pub path: String,
    pub publisher: String,
    pub user: String,
    pub password: String,
    pub topic: String,
}

/// The event filters of a registration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    #[serde(rename = "deviceIdentifiers")]
    pub device_ids: Vec<String>,
    #[serde(rename = "valueDescriptorIdentifiers")]
    pub value_descriptor_ids: Vec<String>,
}

/// The encryption settings of a registration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionDetails {
    #[serde(rename = "encryptionAlgorithm")]
    pub algo: String,
    #[serde(rename = "encryptionKey")]
    pub key: String,
    #[serde(rename = "initializingVector")]
    pub init_vector: String,
}

/// A registration change notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotifyUpdate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub operation: String,
}

impl NotifyUpdate {
    /// Validate this notification, yielding its parsed operation.
    pub fn validate(&self) -> Result<NotifyOperation, AppError> {
        if self.name.is_empty() {
            return Err(AppError::InvalidInput("registration name is required".into()));
        }
        if self.operation.is_empty() {
            return Err(AppError::InvalidInput("operation is required".into()));
        }
        self.operation.parse()
    }
}

/// The operation carried by a registration change notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyOperation {
    Add,
    Update,
    Delete,
}

impl FromStr for NotifyOperation {
    type Err = AppError;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        match val {
            "add" => Ok(Self::Add),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(AppError::InvalidInput(format!("unknown operation '{}'", val))),
        }
    }
}

impl fmt::Display for NotifyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Declare an enum whose variants map one-to-one onto registration field values.
macro_rules! registration_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $val:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// All variants of this enum.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The registration field value of this variant.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $val),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(val: &str) -> Result<Self, Self::Err> {
                match val {
                    $($val => Ok($name::$variant),)+
                    _ => Err(val.to_string()),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

registration_enum!(
    /// Supported export formats.
    ExportFormat {
        Json => "JSON",
        Xml => "XML",
        IotCoreJson => "IOTCORE_JSON",
        AzureJson => "AZURE_JSON",
        AwsJson => "AWS_JSON",
        ThingsBoardJson => "THINGSBOARD_JSON",
        BiotJson => "BIOT_JSON",
        SenmlJson => "SENML_JSON",
        Noop => "NOOP",
    }
);

registration_enum!(
    /// Supported compression algorithms.
    Compression {
        None => "NONE",
        Gzip => "GZIP",
        Zip => "ZIP",
    }
);

registration_enum!(
    /// Supported encryption algorithms.
    EncryptionAlgorithm {
        None => "NONE",
        Aes => "AES",
    }
);

registration_enum!(
    /// Known export destinations.
    Destination {
        Mqtt => "MQTT_TOPIC",
        AzureMqtt => "AZURE_MQTT",
        AwsMqtt => "AWS_MQTT",
        IotCoreMqtt => "IOTCORE_MQTT",
        Rest => "REST_ENDPOINT",
        InfluxDb => "INFLUXDB",
        Zmq => "ZMQ_TOPIC",
        Xmpp => "XMPP_TOPIC",
    }
);

impl Compression {
    /// Parse a registration's compression field, where an empty value means no compression.
    pub fn parse_field(val: &str) -> Result<Self, String> {
        if val.is_empty() {
            Ok(Self::None)
        } else {
            val.parse()
        }
    }
}

impl EncryptionAlgorithm {
    /// Parse a registration's encryption algorithm field, where an empty value means none.
    pub fn parse_field(val: &str) -> Result<Self, String> {
        if val.is_empty() {
            Ok(Self::None)
        } else {
            val.parse()
        }
    }
}
