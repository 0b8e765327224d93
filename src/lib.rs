//! BrokerLink - zero-configuration MQTT session core
//!
//! Finds a pub/sub broker on the local network, keeps one session to it alive, and
//! bridges it to an application layer.
//!
//! # Overview
//!
//! - DNS-SD broker discovery with pluggable backends (mDNS in production)
//! - MQTT 3.1.1 transport with bounded automatic reconnect
//! - Fixed subscription set, re-subscribed on every (re)connect
//! - Exact-topic message routing with a `0`/`1`/`2` control protocol
//! - A single-actor session controller with a readable state and advisory notifications
//!
//! # Quick Start
//!
//! ```no_run
//! use brokerlink::config::BrokerLinkConfig;
//! use brokerlink::discovery::MdnsBackend;
//! use brokerlink::session::{SessionController, SessionState};
//! use brokerlink::transport::mqtt::MqttConnection;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BrokerLinkConfig::default();
//! let connection = MqttConnection::new(&config.retry)?;
//! let session = SessionController::spawn(config, MdnsBackend::new()?, connection);
//!
//! session.start().await?;
//! session
//!     .wait_for_state(SessionState::Ready, Duration::from_secs(30))
//!     .await?;
//! session.publish_device_state("group1", "lamp", true).await?;
//! session.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod observability;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{BrokerLinkConfig, ConfigError, SessionConfig};
pub use discovery::{BrokerAddress, ServiceLocator};
pub use error::{
    ConnectError, DiscoveryError, PublishError, SessionError, SessionResult, SubscribeError,
};
pub use session::{
    DeviceCommand, Notification, SessionController, SessionHandle, SessionSnapshot, SessionState,
};
pub use transport::mqtt::MqttConnection;
