//! Transport layer for the broker session
//!
//! [`Connection`] is the seam between the session controller and the pub/sub wire
//! protocol; [`mqtt::MqttConnection`] is the production implementation and
//! `testing::MockConnection` stands in for it in tests.

use crate::config::SessionConfig;
use crate::discovery::BrokerAddress;
use crate::error::{ConnectError, PublishError, SubscribeError};
use crate::session::events::EventSink;
use rumqttc::QoS;

pub mod mqtt;

/// Connection to a pub/sub broker
///
/// Outcomes of `connect` and `subscribe`, message arrivals and connection loss are
/// reported asynchronously through the [`EventSink`] given to `connect`.
#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Begin connecting. An `Err` means the attempt could not even start; otherwise
    /// the outcome arrives as `Established` or `ConnectFailed` within the connect timeout.
    async fn connect(
        &mut self,
        address: &BrokerAddress,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<(), ConnectError>;

    /// Gracefully close the connection and stop automatic reconnects
    async fn disconnect(&mut self);

    /// Check if the transport currently holds an established connection
    fn is_connected(&self) -> bool;

    /// Queue a subscription request without waiting on the transport; the broker's
    /// answer arrives as `SubscribeAck`
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), SubscribeError>;

    /// Hand a message to the transport without waiting for delivery.
    /// Fails immediately with `NotConnected` rather than buffering.
    fn send(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError>;
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttConnection;
