//! Unified event channel between the session components and the controller
//!
//! Every callback from discovery, the transport and internal timers is funneled into
//! one ordered channel as a [`SessionEvent`]. Each producer is handed an [`EventSink`]
//! stamped with a ticket; the controller drops events whose ticket is no longer current,
//! so a late callback from a cancelled browse or a torn-down connection cannot touch the
//! session.

use crate::discovery::{BrokerAddress, DiscoveryEvent};
use crate::error::{ConnectError, SubscribeError};
use crate::session::router::DeviceCommand;
use crate::session::state::SessionState;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Generation stamp for event producers
pub type Ticket = u64;

/// Message received from the broker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundMessage {
    pub topic: String,
    #[serde(serialize_with = "payload_as_text")]
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

fn payload_as_text<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(payload))
}

/// Transport callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// ConnAck received, on first connect and on every automatic reconnect
    Established { session_present: bool },
    /// The initial connect did not complete
    ConnectFailed(ConnectError),
    /// Unplanned loss of an established connection
    Lost(String),
    /// The transport gave up reconnecting on its own
    ReconnectExhausted(String),
    MessageArrived(InboundMessage),
    SubscribeAck {
        topic: String,
        result: Result<(), SubscribeError>,
    },
}

/// Payload of a [`SessionEvent`]
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Discovery(DiscoveryEvent),
    Connection(ConnectionEvent),
    /// Subscribe acknowledgments are overdue
    SubscribeDeadline,
    /// Backoff before another browse attempt elapsed
    RetryLocate,
}

impl From<DiscoveryEvent> for EventPayload {
    fn from(event: DiscoveryEvent) -> Self {
        EventPayload::Discovery(event)
    }
}

impl From<ConnectionEvent> for EventPayload {
    fn from(event: ConnectionEvent) -> Self {
        EventPayload::Connection(event)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub ticket: Ticket,
    pub payload: EventPayload,
}

/// Ticket-stamped sender handed to event producers
#[derive(Debug, Clone)]
pub struct EventSink {
    ticket: Ticket,
    tx: mpsc::Sender<SessionEvent>,
}

impl EventSink {
    pub fn new(ticket: Ticket, tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { ticket, tx }
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Deliver an event without waiting for channel capacity; returns false when the
    /// channel is full or the consumer is gone
    pub fn try_emit(&self, payload: impl Into<EventPayload>) -> bool {
        self.tx
            .try_send(SessionEvent {
                ticket: self.ticket,
                payload: payload.into(),
            })
            .is_ok()
    }

    /// Deliver an event; returns false once the consumer is gone
    pub async fn emit(&self, payload: impl Into<EventPayload>) -> bool {
        self.tx
            .send(SessionEvent {
                ticket: self.ticket,
                payload: payload.into(),
            })
            .await
            .is_ok()
    }
}

/// Advisory notifications for the application layer
///
/// These never drive control flow inside the core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    DiscoveryStarted {
        service_type: String,
    },
    DiscoveryStopped,
    DiscoveryFailed {
        reason: String,
    },
    ResolveFailed {
        reason: String,
    },
    AddressFound {
        address: BrokerAddress,
    },
    AddressLost {
        address: BrokerAddress,
    },
    Connected {
        address: BrokerAddress,
        session_present: bool,
    },
    ConnectFailed {
        reason: String,
        attempt: u32,
    },
    ConnectionLost {
        reason: String,
    },
    Subscribed {
        topic: String,
    },
    SubscribeFailed {
        topic: String,
        reason: String,
    },
    PublishFailed {
        topic: String,
        reason: String,
    },
    NotConnected {
        topic: String,
    },
    Message {
        message: InboundMessage,
    },
    Command {
        topic: String,
        command: DeviceCommand,
    },
    Failed {
        reason: String,
    },
}

/// Fan-out of notifications to any number of in-process listeners
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    listeners: Arc<Mutex<Vec<mpsc::UnboundedSender<Notification>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; notifications arrive in emission order
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    pub fn notify(&self, notification: Notification) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
