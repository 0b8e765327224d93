//! Broker session lifecycle
//!
//! [`SessionController`] owns the state machine and drives discovery, the transport,
//! the subscription table and the message router. Callers interact with it only
//! through a [`SessionHandle`].

pub mod controller;
pub mod events;
pub mod router;
pub mod state;
pub mod subscription;

pub use controller::{SessionCommand, SessionController, SessionHandle, SessionSnapshot};
pub use events::{
    ConnectionEvent, EventPayload, EventSink, InboundMessage, Notification, Notifier, SessionEvent,
    Ticket,
};
pub use router::{device_topic, DeviceCommand, Dispatch, MessageRouter, PublishRequest, TopicHandler};
pub use state::{ConnectFailureDecision, RetryBudget, SessionState};
pub use subscription::{AckState, Subscription, SubscriptionManager};
