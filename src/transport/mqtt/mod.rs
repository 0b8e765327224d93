//! MQTT 3.1.1 transport built on rumqttc
//!
//! The module separates pure functions from I/O:
//!
//! - [`connection`] - Connection state and option construction
//! - [`message_handler`] - Event routing and subscribe acknowledgment tracking
//! - [`health_monitor`] - Reconnection decisions
//! - [`client`] - The event loop supervisor and [`Connection`](crate::transport::Connection) impl

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttConnection;
pub use connection::{configure_mqtt_options, ConnectionState, ReconnectConfig};
pub use health_monitor::{HealthMonitor, ReconnectionDecision, TransportEvent};
pub use message_handler::{EventRoute, MessageHandler, SubscriptionTracker};
