//! Error taxonomy for broker discovery and session management
//!
//! Component-local errors (one failed subscription, one failed publish) are returned as
//! discrete results. Only connection- and discovery-level failures feed the session
//! state machine.

use crate::session::state::SessionState;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Service discovery failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DiscoveryError {
    #[error("Failed to start browse for {service_type}: {reason}")]
    BrowseStartFailed {
        service_type: String,
        reason: String,
    },

    #[error("Failed to resolve service {name}: {reason}")]
    ResolveFailed { name: String, reason: String },

    #[error("Service lost: {name}")]
    ServiceLost { name: String },

    #[error("Browse ended before a broker was found")]
    BrowseEnded,
}

/// Transport connect failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectError {
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection refused: {0}")]
    Refused(String),

    /// Broker refused the credentials, client id or protocol; retrying cannot help
    #[error("Connection rejected by broker: {0}")]
    Rejected(String),

    #[error("Invalid broker address: {0}")]
    InvalidAddress(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl ConnectError {
    /// Failures that no retry or rediscovery can recover from
    pub fn is_permanent(&self) -> bool {
        matches!(self, ConnectError::Rejected(_))
    }
}

/// Per-topic subscription failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubscribeError {
    #[error("Subscription to {topic} rejected by broker")]
    Rejected { topic: String },

    #[error("Subscription request for {topic} failed: {reason}")]
    RequestFailed { topic: String, reason: String },

    #[error("Subscription to {topic} not acknowledged in time")]
    Unacknowledged { topic: String },
}

impl SubscribeError {
    pub fn topic(&self) -> &str {
        match self {
            SubscribeError::Rejected { topic }
            | SubscribeError::RequestFailed { topic, .. }
            | SubscribeError::Unacknowledged { topic } => topic,
        }
    }
}

/// Outbound publish failures, always surfaced synchronously to the caller
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PublishError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Topic name must not be empty")]
    EmptyTopic,

    #[error("Publishing failed: {0}")]
    PublishFailed(String),
}

/// Top-level error for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Session controller is no longer running")]
    ControllerGone,

    #[error("Timed out waiting for session state {0:?}")]
    StateTimeout(SessionState),

    #[error("Session failed: {0}")]
    Failed(String),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

static SECRET_PATTERN: OnceLock<regex::Regex> = OnceLock::new();
static PATH_PATTERN: OnceLock<regex::Regex> = OnceLock::new();

/// Scrub error text before it leaves the core in an advisory notification.
///
/// Credential-like `key=value` pairs and paths into secret directories are redacted,
/// and the result is capped at 500 bytes.
pub fn sanitize_error_message(message: &str) -> String {
    let secrets = SECRET_PATTERN.get_or_init(|| {
        regex::Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+")
            .expect("secret pattern is a valid regex")
    });
    let paths = PATH_PATTERN.get_or_init(|| {
        regex::Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
            .expect("path pattern is a valid regex")
    });

    let mut sanitized = secrets.replace_all(message, "${1}=***").to_string();
    sanitized = paths.replace_all(&sanitized, "/***REDACTED***/").to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
