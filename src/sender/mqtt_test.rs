use anyhow::Result;

use super::mqtt::*;
use crate::config::Config;
use crate::models::{Addressable, Registration};

fn mqtt_registration(protocol: &str, publisher: &str) -> Registration {
    Registration {
        name: "mqtt".into(),
        destination: "MQTT_TOPIC".into(),
        addressable: Addressable {
            protocol: protocol.into(),
            address: "broker.example.com".into(),
            port: 1883,
            publisher: publisher.into(),
            user: "user".into(),
            password: "pass".into(),
            topic: "edgex".into(),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn generic_settings_use_plain_tcp_by_default() -> Result<()> {
    let config = Config::new_test()?;
    let settings = MqttSettings::generic(&config, &mqtt_registration("tcp", ""))?;

    assert_eq!(settings.client_id, "export-mqtt", "expected a client ID derived from the registration name");
    assert_eq!(settings.port, 1883);
    assert_eq!(settings.topic, "edgex");
    assert_eq!(settings.username.as_deref(), Some("user"));
    assert_eq!(settings.password.as_deref(), Some("pass"));
    assert!(settings.tls.is_none(), "expected no TLS for tcp");

    Ok(())
}

#[test]
fn generic_settings_require_ca_for_tls() -> Result<()> {
    let config = Config::new_test()?;
    assert!(MqttSettings::generic(&config, &mqtt_registration("TLS", "pub")).is_err(), "expected TLS without a CA to be refused");

    let mut config = config.as_ref().clone();
    config.mqtts_ca_file = Some("/etc/distro/ca.pem".into());
    let settings = MqttSettings::generic(&config, &mqtt_registration("ssl", "pub"))?;
    assert_eq!(settings.client_id, "pub", "expected the publisher to be the client ID");
    assert_eq!(
        settings.tls,
        Some(TlsFiles {
            ca: "/etc/distro/ca.pem".into(),
            cert: None,
            key: None,
        })
    );

    Ok(())
}

#[test]
fn aws_settings_target_device_shadow() -> Result<()> {
    let mut config = Config::new_test()?.as_ref().clone();
    assert!(MqttSettings::aws(&config, &mqtt_registration("", "")).is_err(), "expected missing AWS certificates to be refused");

    config.aws_ca_file = Some("ca.pem".into());
    config.aws_cert_file = Some("cert.pem".into());
    config.aws_key_file = Some("key.pem".into());
    let settings = MqttSettings::aws(&config, &mqtt_registration("", ""))?;

    assert_eq!(settings.port, 8883, "expected the AWS port to be forced");
    assert_eq!(settings.topic, "$aws/things/edgex/shadow/update");
    assert!(settings.username.is_none(), "expected no credentials for AWS");
    assert_eq!(settings.tls.and_then(|tls| tls.cert).as_deref(), Some("cert.pem"));

    Ok(())
}

#[test]
fn iotcore_settings_sign_for_project() -> Result<()> {
    let mut config = Config::new_test()?.as_ref().clone();
    config.iotcore_ca_file = Some("roots.pem".into());
    config.iotcore_key_file = Some("rsa_private.pem".into());

    let device = "projects/edgex-demo/locations/us-central1/registries/reg/devices/dev";
    let mut reg = mqtt_registration("tls", device);
    reg.addressable.port = 0;
    let settings = MqttSettings::iotcore(&config, &reg)?;

    assert_eq!(settings.client_id, device);
    assert_eq!(settings.port, 8883, "expected the TLS port as default");
    assert_eq!(settings.token_audience.as_deref(), Some("edgex-demo"));
    assert_eq!(settings.password.as_deref(), Some("rsa_private.pem"));

    let bad = mqtt_registration("tls", "devices/dev");
    assert!(MqttSettings::iotcore(&config, &bad).is_err(), "expected an invalid device path to be refused");

    Ok(())
}

#[test]
fn iotcore_project_extraction() {
    assert_eq!(iotcore_project("projects/p1/locations/l/registries/r/devices/d").as_deref(), Some("p1"));
    assert_eq!(iotcore_project("projects//locations"), None);
    assert_eq!(iotcore_project("p1"), None);
}

#[tokio::test]
async fn mqtt_sender_requires_address_and_topic() -> Result<()> {
    let config = Config::new_test()?;

    let mut reg = mqtt_registration("tcp", "");
    reg.addressable.topic.clear();
    assert!(MqttSender::new(MqttSettings::generic(&config, &reg)?, &config.pem_files).is_err(), "expected a missing topic to be refused");

    let mut reg = mqtt_registration("tcp", "");
    reg.addressable.address.clear();
    assert!(MqttSender::new(MqttSettings::generic(&config, &reg)?, &config.pem_files).is_err(), "expected a missing address to be refused");

    Ok(())
}

#[tokio::test]
async fn mqtt_sender_takes_tls_material_from_loaded_pem_files() -> Result<()> {
    let mut config = Config::new_test()?.as_ref().clone();
    config.mqtts_ca_file = Some("/etc/distro/ca.pem".into());
    let settings = MqttSettings::generic(&config, &mqtt_registration("tls", ""))?;

    assert!(MqttSender::new(settings.clone(), &config.pem_files).is_err(), "expected a CA which was never loaded to be refused");

    config.pem_files.insert("/etc/distro/ca.pem", b"-----BEGIN CERTIFICATE-----");
    assert!(MqttSender::new(settings, &config.pem_files).is_ok(), "expected the loaded CA to be used");

    Ok(())
}
