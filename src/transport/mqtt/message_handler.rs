//! Pure event routing for the MQTT event loop
//!
//! rumqttc reports packets without telling which subscribe request a SubAck answers.
//! Packet ids are assigned in request order and announced as outgoing `Subscribe`
//! events, so [`SubscriptionTracker`] pairs topics with packet ids in that order.

use crate::error::{ConnectError, SubscribeError};
use rumqttc::{ConnectReturnCode, ConnectionError, Event, Outgoing, Packet, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to the appropriate handler
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(connack)) => {
                if connack.code == ConnectReturnCode::Success {
                    EventRoute::ConnectionAcknowledged {
                        session_present: connack.session_present,
                    }
                } else {
                    EventRoute::ConnectionRefused(Self::classify_return_code(connack.code))
                }
            }
            Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            },
            Event::Incoming(Packet::SubAck(suback)) => EventRoute::SubscriptionAcknowledged {
                packet_id: suback.pkid,
                granted: suback
                    .return_codes
                    .iter()
                    .map(|code| matches!(code, SubscribeReasonCode::Success(_)))
                    .collect(),
            },
            Event::Incoming(Packet::Disconnect) => EventRoute::Disconnected,
            Event::Incoming(other) => EventRoute::InfrastructureEvent(format!("{other:?}")),
            Event::Outgoing(Outgoing::Subscribe(packet_id)) => EventRoute::SubscribeSent(*packet_id),
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Classify a ConnAck refusal. Credential, client id and protocol refusals are
    /// permanent; anything else may clear up on a later attempt.
    pub fn classify_return_code(code: ConnectReturnCode) -> ConnectError {
        match code {
            ConnectReturnCode::NotAuthorized
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::RefusedProtocolVersion => ConnectError::Rejected(format!("{code:?}")),
            other => ConnectError::Refused(format!("{other:?}")),
        }
    }

    /// Classify an event loop error raised before the first ConnAck
    pub fn classify_connect_error(error: &ConnectionError) -> ConnectError {
        match error {
            ConnectionError::ConnectionRefused(code) => Self::classify_return_code(*code),
            ConnectionError::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
                ConnectError::Refused(io.to_string())
            }
            other => ConnectError::Transport(other.to_string()),
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// ConnAck with success code
    ConnectionAcknowledged { session_present: bool },
    /// ConnAck with a refusal code
    ConnectionRefused(ConnectError),
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Vec<u8> },
    /// Broker acknowledged a subscribe request
    SubscriptionAcknowledged { packet_id: u16, granted: Vec<bool> },
    /// A subscribe request left with this packet id
    SubscribeSent(u16),
    /// Broker disconnected
    Disconnected,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Pairs subscribe requests with their acknowledgments
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    queued: VecDeque<String>,
    in_flight: HashMap<u16, String>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscribe request about to be handed to the client
    pub fn queue(&mut self, topic: &str) {
        self.queued.push_back(topic.to_string());
    }

    /// Forget the most recent request for `topic` after the client refused it
    pub fn unqueue(&mut self, topic: &str) {
        if let Some(index) = self.queued.iter().rposition(|t| t == topic) {
            self.queued.remove(index);
        }
    }

    /// The oldest queued request went out with `packet_id`
    pub fn sent(&mut self, packet_id: u16) {
        if let Some(topic) = self.queued.pop_front() {
            self.in_flight.insert(packet_id, topic);
        }
    }

    /// Resolve an acknowledgment into the topic and its outcome
    pub fn acknowledge(
        &mut self,
        packet_id: u16,
        granted: &[bool],
    ) -> Option<(String, Result<(), SubscribeError>)> {
        let topic = self.in_flight.remove(&packet_id)?;
        let result = if granted.first().copied().unwrap_or(false) {
            Ok(())
        } else {
            Err(SubscribeError::Rejected {
                topic: topic.clone(),
            })
        };
        debug!(topic = %topic, packet_id, "Subscription acknowledged");
        Some((topic, result))
    }

    /// Drop all bookkeeping, used when a new connection is acknowledged
    pub fn clear(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::{ConnAck, Publish, QoS, SubAck};

    #[test]
    fn test_route_connack() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: true,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged {
                session_present: true
            }
        );

        let refused = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&refused),
            EventRoute::ConnectionRefused(ConnectError::Rejected("NotAuthorized".to_string()))
        );

        let unavailable = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::ServiceUnavailable,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&unavailable),
            EventRoute::ConnectionRefused(ConnectError::Refused(
                "ServiceUnavailable".to_string()
            ))
        );
    }

    #[test]
    fn test_credential_and_identity_refusals_are_permanent() {
        for code in [
            ConnectReturnCode::NotAuthorized,
            ConnectReturnCode::BadUserNamePassword,
            ConnectReturnCode::BadClientId,
            ConnectReturnCode::RefusedProtocolVersion,
        ] {
            assert!(
                MessageHandler::classify_return_code(code).is_permanent(),
                "{code:?}"
            );
        }
        assert!(!MessageHandler::classify_return_code(ConnectReturnCode::ServiceUnavailable)
            .is_permanent());

        let error = ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        assert_eq!(
            MessageHandler::classify_connect_error(&error),
            ConnectError::Rejected("BadUserNamePassword".to_string())
        );
    }

    #[test]
    fn test_route_publish() {
        let mut publish = Publish::new("DAQ", QoS::AtMostOnce, "1");
        publish.payload = Bytes::from_static(b"1");
        let event = Event::Incoming(Packet::Publish(publish));

        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::MessageReceived {
                topic: "DAQ".to_string(),
                payload: b"1".to_vec(),
            }
        );
    }

    #[test]
    fn test_route_suback() {
        let suback = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 4,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&suback),
            EventRoute::SubscriptionAcknowledged {
                packet_id: 4,
                granted: vec![true],
            }
        );

        let rejected = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 5,
            return_codes: vec![SubscribeReasonCode::Failure],
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&rejected),
            EventRoute::SubscriptionAcknowledged {
                packet_id: 5,
                granted: vec![false],
            }
        );
    }

    #[test]
    fn test_route_outgoing_subscribe() {
        let event = Event::Outgoing(Outgoing::Subscribe(9));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::SubscribeSent(9)
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_classify_connect_error() {
        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable);
        assert!(matches!(
            MessageHandler::classify_connect_error(&refused),
            ConnectError::Refused(_)
        ));

        let io = ConnectionError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(matches!(
            MessageHandler::classify_connect_error(&io),
            ConnectError::Refused(_)
        ));

        let reset = ConnectionError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(matches!(
            MessageHandler::classify_connect_error(&reset),
            ConnectError::Transport(_)
        ));
    }

    #[test]
    fn test_tracker_pairs_in_request_order() {
        let mut tracker = SubscriptionTracker::new();
        tracker.queue("DAQ");
        tracker.queue("esp/devices");
        tracker.sent(1);
        tracker.sent(2);

        assert_eq!(
            tracker.acknowledge(2, &[false]),
            Some((
                "esp/devices".to_string(),
                Err(SubscribeError::Rejected {
                    topic: "esp/devices".to_string()
                })
            ))
        );
        assert_eq!(tracker.acknowledge(1, &[true]), Some(("DAQ".to_string(), Ok(()))));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_tracker_ignores_unknown_packet_ids() {
        let mut tracker = SubscriptionTracker::new();
        assert_eq!(tracker.acknowledge(42, &[true]), None);
    }

    #[test]
    fn test_tracker_unqueue() {
        let mut tracker = SubscriptionTracker::new();
        tracker.queue("DAQ");
        tracker.unqueue("DAQ");
        assert!(tracker.is_empty());
    }
}
