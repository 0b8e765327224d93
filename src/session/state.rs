//! Session lifecycle states and retry budgets

use crate::config::{DiscoverySection, RetrySection};
use serde::Serialize;
use std::fmt;

/// Externally readable session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not started, or stopped
    Idle,
    /// Browsing for a broker
    Locating,
    /// Connect issued, waiting for the broker
    Connecting,
    /// Link established, subscriptions not yet issued
    Connected,
    /// Waiting for subscription acknowledgments
    Subscribing,
    /// Subscriptions resolved; publishing is allowed
    Ready,
    /// Link lost; the transport is reconnecting
    Disconnected,
    /// Retry budgets exhausted; only a manual restart leaves this state
    Failed,
}

impl SessionState {
    /// Outbound publishes are only accepted here
    pub fn accepts_publish(self) -> bool {
        matches!(self, SessionState::Ready)
    }

    /// States in which the subscription set may hold entries
    pub fn holds_subscriptions(self) -> bool {
        matches!(self, SessionState::Subscribing | SessionState::Ready)
    }

    /// States in which inbound messages are delivered
    pub fn receives_messages(self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Subscribing | SessionState::Ready
        )
    }

    /// A session in these states can be started
    pub fn can_start(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Locating => "locating",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Subscribing => "subscribing",
            SessionState::Ready => "ready",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What to do after a connect attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailureDecision {
    /// Try the same address again; `attempt` is the 1-based attempt about to start
    RetrySameAddress { attempt: u32 },
    /// Address budget spent; browse for a fresh address
    Relocate,
}

/// Bounded retry accounting for one session run.
///
/// Counters reset when the session reaches Ready.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_connect_attempts: u32,
    max_relocate_cycles: u32,
    max_discovery_failures: u32,
    connect_attempts: u32,
    relocate_cycles: u32,
    discovery_failures: u32,
}

impl RetryBudget {
    pub fn new(retry: &RetrySection, discovery: &DiscoverySection) -> Self {
        Self {
            max_connect_attempts: retry.max_connect_attempts,
            max_relocate_cycles: retry.max_relocate_cycles,
            max_discovery_failures: discovery.max_failures,
            connect_attempts: 0,
            relocate_cycles: 0,
            discovery_failures: 0,
        }
    }

    /// Connect attempts made against the current address
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    pub fn relocate_cycles(&self) -> u32 {
        self.relocate_cycles
    }

    pub fn discovery_failures(&self) -> u32 {
        self.discovery_failures
    }

    /// A connect attempt is about to start
    pub fn on_connect_attempt(&mut self) -> u32 {
        self.connect_attempts += 1;
        self.connect_attempts
    }

    /// The current connect attempt failed
    pub fn on_connect_failure(&self) -> ConnectFailureDecision {
        if self.connect_attempts < self.max_connect_attempts {
            ConnectFailureDecision::RetrySameAddress {
                attempt: self.connect_attempts + 1,
            }
        } else {
            ConnectFailureDecision::Relocate
        }
    }

    /// A rediscovery cycle begins; false once the cycle budget is spent
    pub fn on_relocate(&mut self) -> bool {
        self.relocate_cycles += 1;
        self.connect_attempts = 0;
        self.relocate_cycles <= self.max_relocate_cycles
    }

    /// A browse could not start or ended empty; true once the budget is spent
    pub fn on_discovery_failure(&mut self) -> bool {
        self.discovery_failures += 1;
        self.discovery_failures >= self.max_discovery_failures
    }

    /// A new address was resolved
    pub fn on_address(&mut self) {
        self.connect_attempts = 0;
    }

    pub fn reset(&mut self) {
        self.connect_attempts = 0;
        self.relocate_cycles = 0;
        self.discovery_failures = 0;
    }
}
