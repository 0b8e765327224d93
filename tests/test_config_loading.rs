//! Configuration file loading tests

use brokerlink::config::{BrokerLinkConfig, ConfigError};
use rumqttc::QoS;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_valid_config_file() {
    let file = write_config(
        r#"
[session]
client_id = "kitchen-panel"
clean_session = true
connect_timeout_secs = 5
automatic_reconnect = false

[discovery]
service_type = "_mqtt._tcp"
max_failures = 2

[retry]
max_connect_attempts = 4
backoff_pattern_ms = [100, 200]

[topics]
control = "home/control"
device_list = "home/devices"
qos = 1
"#,
    );

    let config = BrokerLinkConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.session.client_id, "kitchen-panel");
    assert!(config.session.clean_session);
    assert!(!config.session.automatic_reconnect);
    assert_eq!(config.session.keep_alive_secs, 60);
    assert_eq!(config.discovery.service_type, "_mqtt._tcp.local.");
    assert_eq!(config.discovery.max_failures, 2);
    assert_eq!(config.retry.max_connect_attempts, 4);
    assert_eq!(config.retry.max_relocate_cycles, 3);
    assert_eq!(config.retry.backoff_pattern_ms, vec![100, 200]);
    assert_eq!(
        config.topics.subscription_set(),
        vec!["home/control", "home/devices"]
    );
    assert_eq!(config.topics.qos_level(), QoS::AtLeastOnce);
}

#[test]
fn test_empty_file_yields_defaults() {
    let file = write_config("");

    let config = BrokerLinkConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config, BrokerLinkConfig::default());
}

#[test]
fn test_missing_file_is_read_error() {
    let result = BrokerLinkConfig::load_from_file(Path::new("/nonexistent/brokerlink.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let file = write_config("[session\nclient_id = ");

    let result = BrokerLinkConfig::load_from_file(file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_wrong_field_type_is_parse_error() {
    let file = write_config("[session]\nconnect_timeout_secs = \"soon\"\n");

    let result = BrokerLinkConfig::load_from_file(file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_client_id_rejected() {
    let file = write_config("[session]\nclient_id = \"living room/panel\"\n");

    let result = BrokerLinkConfig::load_from_file(file.path());

    assert!(matches!(result, Err(ConfigError::InvalidClientId(_))));
}

#[test]
fn test_out_of_range_qos_rejected() {
    let file = write_config("[topics]\nqos = 3\n");

    let result = BrokerLinkConfig::load_from_file(file.path());

    match result {
        Err(ConfigError::InvalidConfig(message)) => assert!(message.contains("qos")),
        other => panic!("expected invalid config, got {other:?}"),
    }
}

#[test]
fn test_zero_retry_budget_rejected() {
    let file = write_config("[retry]\nmax_relocate_cycles = 0\n");

    let result = BrokerLinkConfig::load_from_file(file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_service_type_forms_normalize_identically() {
    for form in ["_mqtt._tcp", "_mqtt._tcp.", "_mqtt._tcp.local", "_mqtt._tcp.local."] {
        let file = write_config(&format!("[discovery]\nservice_type = \"{form}\"\n"));
        let config = BrokerLinkConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.discovery.service_type, "_mqtt._tcp.local.", "form {form}");
    }
}

#[test]
fn test_effective_config_serializes_back_to_toml() {
    let config = BrokerLinkConfig::default();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = BrokerLinkConfig::from_toml_str(&rendered).unwrap();

    assert_eq!(reparsed, config);
}
