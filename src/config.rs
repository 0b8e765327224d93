//! Session configuration system
//!
//! Configuration is read from a TOML file. Every field carries a default so that an
//! empty file (or no file at all) yields a working setup for the usual `_mqtt._tcp`
//! broker advertised on the local network.

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrokerLinkConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub topics: TopicsSection,
}

/// Connection parameters for a single broker session.
///
/// Immutable for the lifetime of a session once handed to the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Client identifier, stable per install
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Request a clean session from the broker (false keeps session state across reconnects)
    #[serde(default)]
    pub clean_session: bool,
    /// Upper bound on waiting for the broker's ConnAck
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// MQTT keep-alive interval
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Let the transport reconnect on its own after an unplanned disconnect
    #[serde(default = "default_true")]
    pub automatic_reconnect: bool,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            clean_session: false,
            connect_timeout_secs: default_connect_timeout(),
            keep_alive_secs: default_keep_alive(),
            automatic_reconnect: true,
            username_env: None,
            password_env: None,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Resolve broker credentials from the configured environment variables
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = self
            .username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())?;
        let password = self
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default();
        Some((username, password))
    }
}

/// Discovery section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySection {
    /// DNS-SD service type to browse for
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Accumulated discovery failures tolerated before the session fails
    #[serde(default = "default_max_discovery_failures")]
    pub max_failures: u32,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            max_failures: default_max_discovery_failures(),
        }
    }
}

/// Retry budgets for the controller and the transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Immediate connect attempts against one resolved address
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Full rediscovery cycles before giving up
    #[serde(default = "default_max_relocate_cycles")]
    pub max_relocate_cycles: u32,
    /// Automatic reconnect attempts performed by the transport
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Reconnect delays in milliseconds, one per attempt
    #[serde(default = "default_backoff_pattern")]
    pub backoff_pattern_ms: Vec<u64>,
    /// Delay used once the pattern is exhausted
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_connect_attempts: default_max_connect_attempts(),
            max_relocate_cycles: default_max_relocate_cycles(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            backoff_pattern_ms: default_backoff_pattern(),
            sustained_delay_ms: default_sustained_delay(),
        }
    }
}

/// Fixed subscription set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicsSection {
    /// Control topic carrying the 0/1/2 command protocol
    #[serde(default = "default_control_topic")]
    pub control: String,
    /// Device listing topic, passed through verbatim
    #[serde(default = "default_device_list_topic")]
    pub device_list: String,
    /// Subscription QoS level (0, 1 or 2)
    #[serde(default)]
    pub qos: u8,
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            control: default_control_topic(),
            device_list: default_device_list_topic(),
            qos: 0,
        }
    }
}

impl TopicsSection {
    /// Topics subscribed on every successful connect, control topic first
    pub fn subscription_set(&self) -> Vec<String> {
        vec![self.control.clone(), self.device_list.clone()]
    }

    pub fn qos_level(&self) -> QoS {
        qos_from_u8(self.qos).unwrap_or(QoS::AtMostOnce)
    }
}

fn default_client_id() -> String {
    "brokerlink-client".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_keep_alive() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_service_type() -> String {
    "_mqtt._tcp.local.".to_string()
}

fn default_max_discovery_failures() -> u32 {
    5
}

fn default_max_connect_attempts() -> u32 {
    3
}

fn default_max_relocate_cycles() -> u32 {
    3
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![250, 500, 1000, 2000]
}

fn default_sustained_delay() -> u64 {
    2000
}

fn default_control_topic() -> String {
    "DAQ".to_string()
}

fn default_device_list_topic() -> String {
    "esp/devices".to_string()
}

/// Map a numeric QoS level onto the MQTT enum
pub fn qos_from_u8(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid client ID format: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BrokerLinkConfig {
    /// Load configuration from a TOML file, normalize and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: BrokerLinkConfig = toml::from_str(content)?;
        config.discovery.service_type = normalize_service_type(&config.discovery.service_type);
        config.validate()?;
        Ok(config)
    }

    /// Check field ranges and cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.session.client_id)?;

        if self.session.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.session.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.keep_alive_secs must be greater than 0".to_string(),
            ));
        }
        if self.discovery.service_type.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "discovery.service_type must not be empty".to_string(),
            ));
        }
        if self.discovery.max_failures == 0 {
            return Err(ConfigError::InvalidConfig(
                "discovery.max_failures must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_connect_attempts == 0 || self.retry.max_relocate_cycles == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry budgets must be greater than 0".to_string(),
            ));
        }
        if self.retry.sustained_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry.sustained_delay_ms must be greater than 0".to_string(),
            ));
        }
        if qos_from_u8(self.topics.qos).is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "topics.qos must be 0, 1 or 2 (got {})",
                self.topics.qos
            )));
        }
        if self.topics.control.is_empty() || self.topics.device_list.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "subscription topics must not be empty".to_string(),
            ));
        }
        if self.topics.control == self.topics.device_list {
            return Err(ConfigError::InvalidConfig(
                "control and device_list topics must differ".to_string(),
            ));
        }

        Ok(())
    }
}

/// Append the `local.` domain to bare DNS-SD service types.
///
/// `_mqtt._tcp.` and `_mqtt._tcp` both become `_mqtt._tcp.local.`.
pub fn normalize_service_type(service_type: &str) -> String {
    let trimmed = service_type.trim();
    if trimmed.ends_with(".local.") {
        return trimmed.to_string();
    }
    if let Some(stripped) = trimmed.strip_suffix(".local") {
        return format!("{stripped}.local.");
    }
    format!("{}.local.", trimmed.trim_end_matches('.'))
}

fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BrokerLinkConfig::from_toml_str("").unwrap();
        assert_eq!(config.session.client_id, "brokerlink-client");
        assert!(!config.session.clean_session);
        assert!(config.session.automatic_reconnect);
        assert_eq!(config.session.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.keep_alive(), Duration::from_secs(60));
        assert_eq!(config.discovery.service_type, "_mqtt._tcp.local.");
        assert_eq!(config.topics.subscription_set(), vec!["DAQ", "esp/devices"]);
        assert_eq!(config.topics.qos_level(), QoS::AtMostOnce);
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[session]
client_id = "tablet-01"
connect_timeout_secs = 5
keep_alive_secs = 30
automatic_reconnect = false
username_env = "MQTT_USERNAME"

[discovery]
service_type = "_mqtt._tcp."
max_failures = 2

[retry]
max_connect_attempts = 2
max_relocate_cycles = 4
backoff_pattern_ms = [10, 20]

[topics]
control = "lab/control"
device_list = "lab/devices"
qos = 1
"#;

        let config = BrokerLinkConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.session.client_id, "tablet-01");
        assert!(!config.session.automatic_reconnect);
        assert_eq!(config.session.username_env.as_deref(), Some("MQTT_USERNAME"));
        assert_eq!(config.discovery.service_type, "_mqtt._tcp.local.");
        assert_eq!(config.retry.max_relocate_cycles, 4);
        assert_eq!(config.retry.backoff_pattern_ms, vec![10, 20]);
        assert_eq!(config.retry.sustained_delay_ms, 2000);
        assert_eq!(config.topics.qos_level(), QoS::AtLeastOnce);
    }

    #[test]
    fn test_invalid_client_id() {
        assert!(validate_client_id("bad client").is_err());
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("AndroidClient").is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_qos() {
        let result = BrokerLinkConfig::from_toml_str("[topics]\nqos = 3\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_duplicate_topics() {
        let result =
            BrokerLinkConfig::from_toml_str("[topics]\ncontrol = \"x\"\ndevice_list = \"x\"\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let result = BrokerLinkConfig::from_toml_str("[session]\nconnect_timeout_secs = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_normalize_service_type() {
        assert_eq!(normalize_service_type("_mqtt._tcp."), "_mqtt._tcp.local.");
        assert_eq!(normalize_service_type("_mqtt._tcp"), "_mqtt._tcp.local.");
        assert_eq!(normalize_service_type("_mqtt._tcp.local"), "_mqtt._tcp.local.");
        assert_eq!(
            normalize_service_type("_mqtt._tcp.local."),
            "_mqtt._tcp.local."
        );
    }

    #[test]
    fn test_credentials_require_username() {
        let config = SessionConfig::default();
        assert!(config.credentials().is_none());

        let config = SessionConfig {
            username_env: Some("BROKERLINK_TEST_UNSET_USER_VAR".to_string()),
            ..Default::default()
        };
        assert!(config.credentials().is_none());
    }
}
