//! Pure connection state management for the MQTT transport
//!
//! Connection state, reconnection settings, and option construction from a resolved
//! broker address and the session configuration.

use crate::config::{RetrySection, SessionConfig};
use crate::discovery::BrokerAddress;
use crate::error::ConnectError;
use rumqttc::MqttOptions;
use std::time::Duration;
use url::{Host, Url};

/// Connection state for the MQTT transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - waiting for the first ConnAck
    Connecting,
    /// ConnAck received, ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Automatic reconnect in progress (attempt count)
    Reconnecting(u32),
    /// Reconnect budget spent or reconnect disabled
    PermanentlyDisconnected(String),
}

/// Automatic reconnection settings
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds, one entry per attempt
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from_retry(&RetrySection::default())
    }
}

impl ReconnectConfig {
    pub fn from_retry(retry: &RetrySection) -> Self {
        Self {
            max_attempts: Some(retry.max_reconnect_attempts),
            backoff_pattern: retry.backoff_pattern_ms.clone(),
            sustained_delay: retry.sustained_delay_ms,
        }
    }

    /// Backoff delay for the given 1-based attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Total time spent sleeping across all attempts, None if unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts
            .map(|max| (1..=max).map(|a| self.calculate_backoff_delay(a)).sum())
    }
}

/// Split a broker address into host and port, rejecting malformed input
pub fn parse_broker_address(address: &BrokerAddress) -> Result<(String, u16), ConnectError> {
    let uri = address.uri();
    let url = Url::parse(&uri).map_err(|_| ConnectError::InvalidAddress(uri.clone()))?;

    let host = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        _ => return Err(ConnectError::InvalidAddress(uri)),
    };

    match url.port() {
        Some(port) if port != 0 => Ok((host, port)),
        _ => Err(ConnectError::InvalidAddress(uri)),
    }
}

/// Build rumqttc options for one session against one resolved address
pub fn configure_mqtt_options(
    address: &BrokerAddress,
    config: &SessionConfig,
) -> Result<MqttOptions, ConnectError> {
    let (host, port) = parse_broker_address(address)?;

    let mut mqtt_options = MqttOptions::new(config.client_id.clone(), host, port);
    mqtt_options.set_clean_session(config.clean_session);

    // Keep-alive below 5 s is clamped
    mqtt_options.set_keep_alive(config.keep_alive().max(Duration::from_secs(5)));

    if let Some((username, password)) = config.credentials() {
        mqtt_options.set_credentials(username, password);
    }

    Ok(mqtt_options)
}
