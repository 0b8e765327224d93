//! Inbound dispatch and outbound publish gateway
//!
//! Inbound messages are matched by exact topic against a small handler table. The
//! control topic carries a one-character command protocol; every other topic is
//! passed through to listeners untouched.

use crate::config::TopicsSection;
use crate::error::PublishError;
use crate::session::events::InboundMessage;
use crate::transport::Connection;
use rumqttc::QoS;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// Command carried on the control topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCommand {
    Off,
    On,
    /// Tear down the view driven by this session; the core keeps running
    Close,
}

impl DeviceCommand {
    /// `"0"`, `"1"` and `"2"` map to Off, On and Close; anything else is ignored
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            b"0" => Some(DeviceCommand::Off),
            b"1" => Some(DeviceCommand::On),
            b"2" => Some(DeviceCommand::Close),
            _ => None,
        }
    }
}

/// Handler kinds in the dispatch table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicHandler {
    Control,
    PassThrough,
}

/// Result of dispatching one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Command {
        topic: String,
        command: DeviceCommand,
    },
    Forward(InboundMessage),
    /// Unrecognized control payload
    Ignored { topic: String },
}

/// Outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

impl PublishRequest {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }

    /// On/off command for one device, `"1"` or `"0"` on `<group>/<device>`
    pub fn device_state(group: &str, device: &str, on: bool) -> Self {
        let payload = if on { "1" } else { "0" };
        Self::new(device_topic(group, device), payload, QoS::AtMostOnce)
    }
}

/// Topic addressing one device of a group
pub fn device_topic(group: &str, device: &str) -> String {
    format!("{group}/{device}")
}

/// Exact-match dispatch table plus the publish pass-through
#[derive(Debug, Clone)]
pub struct MessageRouter {
    handlers: HashMap<String, TopicHandler>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn from_topics(topics: &TopicsSection) -> Self {
        let mut router = Self::new();
        router.register(&topics.control, TopicHandler::Control);
        router.register(&topics.device_list, TopicHandler::PassThrough);
        router
    }

    pub fn register(&mut self, topic: &str, handler: TopicHandler) {
        self.handlers.insert(topic.to_string(), handler);
    }

    pub fn handler_for(&self, topic: &str) -> TopicHandler {
        self.handlers
            .get(topic)
            .copied()
            .unwrap_or(TopicHandler::PassThrough)
    }

    /// Dispatch one inbound message. Stateless, so repeats dispatch again.
    pub fn on_message(&self, message: InboundMessage) -> Dispatch {
        match self.handler_for(&message.topic) {
            TopicHandler::Control => match DeviceCommand::from_payload(&message.payload) {
                Some(command) => Dispatch::Command {
                    topic: message.topic,
                    command,
                },
                None => {
                    debug!(
                        topic = %message.topic,
                        payload = %message.payload_str(),
                        "Ignoring unrecognized control payload"
                    );
                    Dispatch::Ignored {
                        topic: message.topic,
                    }
                }
            },
            TopicHandler::PassThrough => Dispatch::Forward(message),
        }
    }

    /// Hand a message to the transport; only an empty topic is rejected here
    pub fn publish<C: Connection>(
        &self,
        connection: &C,
        request: &PublishRequest,
    ) -> Result<(), PublishError> {
        if request.topic.is_empty() {
            return Err(PublishError::EmptyTopic);
        }
        connection.send(&request.topic, request.payload.clone(), request.qos)
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}
