//! Pure reconnection logic for the MQTT transport
//!
//! Decides whether the event loop should try again after an error and which
//! [`ConnectionState`] follows each transport event.

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{error, info, warn};

/// Reconnection decisions and state bookkeeping
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Determine next state after a transport event
    pub fn determine_next_state(event: TransportEvent) -> ConnectionState {
        match event {
            TransportEvent::ConnAckReceived => ConnectionState::Connected,
            TransportEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            TransportEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            TransportEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            TransportEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Check if connection state allows publishing and subscribing
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!("MQTT connection lost: {}", reason);
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!("Reconnection successful");
            }
            (ConnectionState::Disconnected(_), ConnectionState::Reconnecting(attempt))
            | (ConnectionState::Reconnecting(_), ConnectionState::Reconnecting(attempt)) => {
                info!("Starting reconnection attempt {}", attempt);
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!("MQTT connection permanently failed: {}", reason);
            }
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Validate reconnection configuration
    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }

        if config.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Transport events that trigger state transitions
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker initiated disconnect
    DisconnectedByBroker,
    /// Network or protocol error
    NetworkError(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Permanent failure - no more retries
    PermanentFailure(String),
}
