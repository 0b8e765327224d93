//! Mock implementations for testing
//!
//! Provides a scriptable discovery backend and a scriptable broker connection so the
//! session controller can be exercised without a network. Both record every call
//! and allow events to be injected at any point.

use crate::config::SessionConfig;
use crate::discovery::{BackendEvent, BrokerAddress, DiscoveryBackend};
use crate::error::{ConnectError, DiscoveryError, PublishError, SubscribeError};
use crate::session::events::{ConnectionEvent, EventSink, InboundMessage};
use crate::transport::Connection;
use async_trait::async_trait;
use rumqttc::QoS;
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

pub type PublishedMessage = (String, Vec<u8>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct DiscoveryState {
    browse_calls: Vec<String>,
    stop_calls: Vec<String>,
    failing_browses: u32,
    auto_announce: Option<(String, IpAddr, u16)>,
    sender: Option<mpsc::Sender<BackendEvent>>,
}

/// Mock discovery backend
#[derive(Debug, Clone, Default)]
pub struct MockDiscoveryBackend {
    state: Arc<Mutex<DiscoveryState>>,
}

impl MockDiscoveryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every browse immediately resolves this broker
    pub fn with_broker(name: &str, ip: IpAddr, port: u16) -> Self {
        let backend = Self::new();
        lock(&backend.state).auto_announce = Some((name.to_string(), ip, port));
        backend
    }

    /// The next `count` browse starts fail
    pub fn fail_next_browses(&self, count: u32) {
        lock(&self.state).failing_browses = count;
    }

    pub fn browse_count(&self) -> usize {
        lock(&self.state).browse_calls.len()
    }

    pub fn stop_count(&self) -> usize {
        lock(&self.state).stop_calls.len()
    }

    pub fn browsed_types(&self) -> Vec<String> {
        lock(&self.state).browse_calls.clone()
    }

    /// Push a raw event into the most recent browse
    pub async fn emit(&self, event: BackendEvent) -> bool {
        let sender = lock(&self.state).sender.clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Advertise and resolve a broker on the most recent browse
    pub async fn announce(&self, name: &str, ip: IpAddr, port: u16) -> bool {
        self.emit(resolved_event(name, ip, port)).await
    }

    /// Withdraw an advertisement from the most recent browse
    pub async fn lose(&self, name: &str) -> bool {
        self.emit(BackendEvent::Lost {
            name: name.to_string(),
            service_type: "_mqtt._tcp.local.".to_string(),
        })
        .await
    }
}

fn resolved_event(name: &str, ip: IpAddr, port: u16) -> BackendEvent {
    BackendEvent::Resolved {
        name: name.to_string(),
        service_type: "_mqtt._tcp.local.".to_string(),
        addresses: vec![ip],
        port,
    }
}

impl DiscoveryBackend for MockDiscoveryBackend {
    fn browse(&self, service_type: &str) -> Result<mpsc::Receiver<BackendEvent>, DiscoveryError> {
        let mut state = lock(&self.state);
        state.browse_calls.push(service_type.to_string());

        if state.failing_browses > 0 {
            state.failing_browses -= 1;
            return Err(DiscoveryError::BrowseStartFailed {
                service_type: service_type.to_string(),
                reason: "mock browse failure".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(64);
        if let Some((name, ip, port)) = state.auto_announce.clone() {
            let _ = tx.try_send(BackendEvent::Found {
                name: name.clone(),
                service_type: service_type.to_string(),
            });
            let _ = tx.try_send(resolved_event(&name, ip, port));
        }
        state.sender = Some(tx);
        Ok(rx)
    }

    fn stop_browse(&self, service_type: &str) {
        lock(&self.state).stop_calls.push(service_type.to_string());
    }
}

/// Scripted outcome of one `connect` call
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    /// Report `Established` right away
    Establish,
    /// Accept the attempt, then report `ConnectFailed`
    Fail(ConnectError),
    /// Reject the attempt synchronously
    Refuse(ConnectError),
    /// Accept the attempt and report nothing; use `inject` to finish it
    Pending,
}

#[derive(Debug, Default)]
struct ConnectionLog {
    connected: bool,
    script: VecDeque<ConnectOutcome>,
    sink: Option<EventSink>,
    connects: Vec<BrokerAddress>,
    configs: Vec<SessionConfig>,
    subscribes: Vec<String>,
    sent: Vec<PublishedMessage>,
    send_attempts: usize,
    disconnects: usize,
    rejected_topics: HashSet<String>,
    unacknowledged_topics: HashSet<String>,
    failing_requests: HashSet<String>,
    fail_send: bool,
}

/// Mock broker connection
#[derive(Debug, Clone, Default)]
pub struct MockConnection {
    state: Arc<Mutex<ConnectionLog>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection that already reports itself established
    pub fn connected() -> Self {
        let connection = Self::new();
        lock(&connection.state).connected = true;
        connection
    }

    /// Queue outcomes for upcoming connect calls; unscripted calls establish
    pub fn script_connects(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        lock(&self.state).script.extend(outcomes);
    }

    /// The broker answers subscriptions to `topic` with a rejection
    pub fn reject_topic(&self, topic: &str) {
        lock(&self.state).rejected_topics.insert(topic.to_string());
    }

    /// The broker never answers subscriptions to `topic`
    pub fn withhold_ack(&self, topic: &str) {
        lock(&self.state)
            .unacknowledged_topics
            .insert(topic.to_string());
    }

    /// Subscribe requests for `topic` fail before reaching the broker
    pub fn fail_subscribe_request(&self, topic: &str) {
        lock(&self.state)
            .failing_requests
            .insert(topic.to_string());
    }

    pub fn fail_sends(&self) {
        lock(&self.state).fail_send = true;
    }

    pub fn connect_calls(&self) -> Vec<BrokerAddress> {
        lock(&self.state).connects.clone()
    }

    pub fn connect_configs(&self) -> Vec<SessionConfig> {
        lock(&self.state).configs.clone()
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        lock(&self.state).subscribes.clone()
    }

    pub fn sent_messages(&self) -> Vec<PublishedMessage> {
        lock(&self.state).sent.clone()
    }

    /// Every `send` call, including rejected ones
    pub fn send_attempts(&self) -> usize {
        lock(&self.state).send_attempts
    }

    pub fn disconnect_count(&self) -> usize {
        lock(&self.state).disconnects
    }

    /// Deliver an event through the sink of the most recent connect, even after
    /// that connection was closed
    pub async fn inject(&self, event: ConnectionEvent) -> bool {
        let sink = lock(&self.state).sink.clone();
        match sink {
            Some(sink) => sink.emit(event).await,
            None => false,
        }
    }

    /// Simulate an unplanned disconnect
    pub async fn drop_connection(&self, reason: &str) -> bool {
        lock(&self.state).connected = false;
        self.inject(ConnectionEvent::Lost(reason.to_string())).await
    }

    /// Simulate a successful automatic reconnect
    pub async fn reestablish(&self) -> bool {
        lock(&self.state).connected = true;
        self.inject(ConnectionEvent::Established {
            session_present: true,
        })
        .await
    }

    /// Simulate the transport giving up on reconnecting
    pub async fn exhaust_reconnect(&self) -> bool {
        self.inject(ConnectionEvent::ReconnectExhausted(
            "reconnect budget spent".to_string(),
        ))
        .await
    }

    /// Simulate an inbound message
    pub async fn deliver(&self, topic: &str, payload: &str) -> bool {
        self.inject(ConnectionEvent::MessageArrived(InboundMessage::new(
            topic, payload,
        )))
        .await
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn connect(
        &mut self,
        address: &BrokerAddress,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<(), ConnectError> {
        let outcome = {
            let mut state = lock(&self.state);
            state.connects.push(address.clone());
            state.configs.push(config.clone());
            state.connected = false;
            state.sink = Some(events.clone());
            state.script.pop_front().unwrap_or(ConnectOutcome::Establish)
        };

        match outcome {
            ConnectOutcome::Establish => {
                lock(&self.state).connected = true;
                events
                    .emit(ConnectionEvent::Established {
                        session_present: false,
                    })
                    .await;
                Ok(())
            }
            ConnectOutcome::Fail(error) => {
                events.emit(ConnectionEvent::ConnectFailed(error)).await;
                Ok(())
            }
            ConnectOutcome::Refuse(error) => Err(error),
            ConnectOutcome::Pending => Ok(()),
        }
    }

    async fn disconnect(&mut self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.disconnects += 1;
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), SubscribeError> {
        let (sink, ack) = {
            let mut state = lock(&self.state);
            state.subscribes.push(topic.to_string());

            if state.failing_requests.contains(topic) {
                return Err(SubscribeError::RequestFailed {
                    topic: topic.to_string(),
                    reason: "mock request failure".to_string(),
                });
            }
            if state.unacknowledged_topics.contains(topic) {
                return Ok(());
            }
            let ack = if state.rejected_topics.contains(topic) {
                Err(SubscribeError::Rejected {
                    topic: topic.to_string(),
                })
            } else {
                Ok(())
            };
            (state.sink.clone(), ack)
        };

        if let Some(sink) = sink {
            sink.try_emit(ConnectionEvent::SubscribeAck {
                topic: topic.to_string(),
                result: ack,
            });
        }
        Ok(())
    }

    fn send(&self, topic: &str, payload: Vec<u8>, _qos: QoS) -> Result<(), PublishError> {
        let mut state = lock(&self.state);
        state.send_attempts += 1;

        if !state.connected {
            return Err(PublishError::NotConnected);
        }
        if state.fail_send {
            return Err(PublishError::PublishFailed("mock transport rejection".to_string()));
        }
        state.sent.push((topic.to_string(), payload));
        Ok(())
    }
}
