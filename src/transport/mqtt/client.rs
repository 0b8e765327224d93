//! Impure I/O operations for the MQTT transport
//!
//! Owns the rumqttc client and a supervisor task that polls the event loop, reports
//! connection outcomes to the session, and performs automatic reconnects.

use super::connection::{configure_mqtt_options, ConnectionState, ReconnectConfig};
use super::health_monitor::{HealthMonitor, ReconnectionDecision, TransportEvent};
use super::message_handler::{EventRoute, MessageHandler, SubscriptionTracker};
use crate::config::{ConfigError, RetrySection, SessionConfig};
use crate::discovery::BrokerAddress;
use crate::error::{ConnectError, PublishError, SubscribeError};
use crate::session::events::{ConnectionEvent, EventSink, InboundMessage};
use crate::transport::Connection;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Outgoing, QoS};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Bound on flushing a graceful Disconnect before the event loop is dropped
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Bound on waiting for the supervisor task to exit on disconnect
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

fn lock_tracker(tracker: &Mutex<SubscriptionTracker>) -> MutexGuard<'_, SubscriptionTracker> {
    tracker
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// MQTT 3.1.1 connection driven by rumqttc
pub struct MqttConnection {
    client: Option<AsyncClient>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    event_loop_handle: Option<JoinHandle<()>>,
    tracker: Arc<Mutex<SubscriptionTracker>>,
    reconnect_config: ReconnectConfig,
}

impl MqttConnection {
    pub fn new(retry: &RetrySection) -> Result<Self, ConfigError> {
        let reconnect_config = ReconnectConfig::from_retry(retry);
        HealthMonitor::validate_connection_config(&reconnect_config)
            .map_err(ConfigError::InvalidConfig)?;

        Ok(Self {
            client: None,
            state_rx: None,
            shutdown_tx: None,
            event_loop_handle: None,
            tracker: Arc::new(Mutex::new(SubscriptionTracker::new())),
            reconnect_config,
        })
    }

    /// Current transport state, `None` before the first connect
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect_config
    }

    /// Stop the supervisor, sending a Disconnect first if the link is up
    async fn teardown(&mut self) {
        let Some(mut handle) = self.event_loop_handle.take() else {
            self.client = None;
            return;
        };

        if let Some(client) = self.client.take() {
            if self.is_connected() {
                if let Err(e) = client.try_disconnect() {
                    debug!("Disconnect request not queued: {}", e);
                }
            }
        }
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            warn!("MQTT supervisor did not stop in time, aborting");
            handle.abort();
        }
        lock_tracker(&self.tracker).clear();
    }
}

#[async_trait]
impl Connection for MqttConnection {
    async fn connect(
        &mut self,
        address: &BrokerAddress,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<(), ConnectError> {
        self.teardown().await;

        let mqtt_options = configure_mqtt_options(address, config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        lock_tracker(&self.tracker).clear();

        let supervisor = Supervisor {
            event_loop,
            state_tx,
            shutdown_rx,
            tracker: self.tracker.clone(),
            events,
            reconnect_config: self.reconnect_config.clone(),
            connect_timeout: config.connect_timeout(),
            automatic_reconnect: config.automatic_reconnect,
        };

        info!(broker = %address, client_id = %config.client_id, "Connecting to MQTT broker");
        let span = crate::mqtt_span!(broker = %address);
        self.event_loop_handle = Some(tokio::spawn(supervisor.run().instrument(span)));
        self.client = Some(client);
        self.state_rx = Some(state_rx);
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.event_loop_handle.is_some() {
            info!("Disconnecting from MQTT broker");
        }
        self.teardown().await;
    }

    fn is_connected(&self) -> bool {
        self.state_rx
            .as_ref()
            .is_some_and(|rx| HealthMonitor::can_publish(&rx.borrow()))
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), SubscribeError> {
        let client = self
            .client
            .as_ref()
            .filter(|_| self.is_connected())
            .ok_or_else(|| SubscribeError::RequestFailed {
                topic: topic.to_string(),
                reason: "not connected".to_string(),
            })?;

        lock_tracker(&self.tracker).queue(topic);
        if let Err(e) = client.try_subscribe(topic, qos) {
            lock_tracker(&self.tracker).unqueue(topic);
            return Err(SubscribeError::RequestFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }

        debug!(topic = %topic, ?qos, "Subscribe requested");
        Ok(())
    }

    fn send(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        let client = self.client.as_ref().ok_or(PublishError::NotConnected)?;

        client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| PublishError::PublishFailed(e.to_string()))
    }
}

/// Outcome of one poll of the event loop
enum Polled {
    Event(Event),
    Error(ConnectionError),
    TimedOut,
    Shutdown,
}

/// Supervisor task state for one connection
struct Supervisor {
    event_loop: EventLoop,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    tracker: Arc<Mutex<SubscriptionTracker>>,
    events: EventSink,
    reconnect_config: ReconnectConfig,
    connect_timeout: Duration,
    automatic_reconnect: bool,
}

impl Supervisor {
    async fn run(mut self) {
        let mut established = false;
        let mut reconnect_attempts = 0u32;
        let mut deadline = Instant::now() + self.connect_timeout;

        loop {
            let connected = self.is_connected();
            let polled = tokio::select! {
                biased;
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        Polled::Shutdown
                    } else {
                        continue;
                    }
                }
                result = Self::poll(&mut self.event_loop, connected, deadline) => result,
            };

            let keep_running = match polled {
                Polled::Shutdown => {
                    if self.is_connected() {
                        self.drain().await;
                    }
                    info!("Shutdown signal received, stopping MQTT supervisor");
                    false
                }
                Polled::Event(event) => match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged { session_present } => {
                        if established {
                            info!(attempts = reconnect_attempts, "Reconnection successful");
                        }
                        established = true;
                        reconnect_attempts = 0;
                        lock_tracker(&self.tracker).clear();
                        self.set_state(HealthMonitor::determine_next_state(
                            TransportEvent::ConnAckReceived,
                        ));
                        self.events
                            .emit(ConnectionEvent::Established { session_present })
                            .await
                    }
                    EventRoute::ConnectionRefused(error) => {
                        self.on_error(established, error, &mut reconnect_attempts, &mut deadline)
                            .await
                    }
                    EventRoute::MessageReceived { topic, payload } => {
                        debug!(topic = %topic, bytes = payload.len(), "Message received");
                        self.events
                            .emit(ConnectionEvent::MessageArrived(InboundMessage::new(
                                topic, payload,
                            )))
                            .await
                    }
                    EventRoute::SubscribeSent(packet_id) => {
                        lock_tracker(&self.tracker).sent(packet_id);
                        true
                    }
                    EventRoute::SubscriptionAcknowledged { packet_id, granted } => {
                        let resolved = lock_tracker(&self.tracker).acknowledge(packet_id, &granted);
                        match resolved {
                            Some((topic, result)) => {
                                self.events
                                    .emit(ConnectionEvent::SubscribeAck { topic, result })
                                    .await
                            }
                            None => {
                                debug!(packet_id, "SubAck for unknown request");
                                true
                            }
                        }
                    }
                    EventRoute::Disconnected => {
                        let reason = "Broker disconnected".to_string();
                        self.on_loss(reason, &mut reconnect_attempts, &mut deadline)
                            .await
                    }
                    EventRoute::InfrastructureEvent(event) => {
                        debug!(target: "mqtt_transport", "MQTT event: {}", event);
                        true
                    }
                    EventRoute::OutgoingEvent => true,
                },
                Polled::Error(e) => {
                    // A refused reconnect keeps its ConnAck classification
                    let error = if established && !matches!(e, ConnectionError::ConnectionRefused(_)) {
                        ConnectError::Transport(e.to_string())
                    } else {
                        MessageHandler::classify_connect_error(&e)
                    };
                    self.on_error(established, error, &mut reconnect_attempts, &mut deadline)
                        .await
                }
                Polled::TimedOut => {
                    let error = ConnectError::Timeout(self.connect_timeout);
                    self.on_error(established, error, &mut reconnect_attempts, &mut deadline)
                        .await
                }
            };

            if !keep_running {
                break;
            }
        }

        debug!("MQTT supervisor stopped");
    }

    /// Poll once; while not connected the poll is bounded by the connect deadline
    async fn poll(event_loop: &mut EventLoop, connected: bool, deadline: Instant) -> Polled {
        if connected {
            return match event_loop.poll().await {
                Ok(event) => Polled::Event(event),
                Err(e) => Polled::Error(e),
            };
        }
        match tokio::time::timeout_at(deadline, event_loop.poll()).await {
            Ok(Ok(event)) => Polled::Event(event),
            Ok(Err(e)) => Polled::Error(e),
            Err(_) => Polled::TimedOut,
        }
    }

    fn is_connected(&self) -> bool {
        HealthMonitor::can_publish(&self.state_tx.borrow())
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.borrow().clone();
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }
        let _ = self.state_tx.send(next);
    }

    /// A failed poll: before the first ConnAck it ends this connect attempt, and a
    /// permanent rejection ends the connection at any point
    async fn on_error(
        &mut self,
        established: bool,
        error: ConnectError,
        reconnect_attempts: &mut u32,
        deadline: &mut Instant,
    ) -> bool {
        if !established || error.is_permanent() {
            warn!("MQTT connect failed: {}", error);
            self.set_state(HealthMonitor::determine_next_state(
                TransportEvent::PermanentFailure(error.to_string()),
            ));
            self.events.emit(ConnectionEvent::ConnectFailed(error)).await;
            return false;
        }
        self.on_loss(error.to_string(), reconnect_attempts, deadline)
            .await
    }

    /// Loss of an established link, or a failed reconnect attempt
    async fn on_loss(
        &mut self,
        reason: String,
        reconnect_attempts: &mut u32,
        deadline: &mut Instant,
    ) -> bool {
        if self.is_connected() {
            self.set_state(HealthMonitor::determine_next_state(
                TransportEvent::NetworkError(reason.clone()),
            ));
            if !self.events.emit(ConnectionEvent::Lost(reason.clone())).await {
                return false;
            }
        } else {
            debug!(attempt = *reconnect_attempts, "Reconnect attempt failed: {}", reason);
        }

        if !self.automatic_reconnect {
            self.set_state(HealthMonitor::determine_next_state(
                TransportEvent::PermanentFailure("automatic reconnect disabled".to_string()),
            ));
            return false;
        }

        let decision = HealthMonitor::should_attempt_reconnection(
            *reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *reconnect_attempts = attempt;
                self.set_state(HealthMonitor::determine_next_state(
                    TransportEvent::ReconnectionStarted(attempt),
                ));

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                if !self.interruptible_sleep(delay_ms).await {
                    return false;
                }
                *deadline = Instant::now() + self.connect_timeout;
                true
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                error!(attempts = *reconnect_attempts, "Reconnect attempts exhausted");
                self.set_state(HealthMonitor::determine_next_state(
                    TransportEvent::PermanentFailure(reason.clone()),
                ));
                self.events
                    .emit(ConnectionEvent::ReconnectExhausted(reason))
                    .await;
                false
            }
            ReconnectionDecision::AbortShutdownRequested => false,
        }
    }

    /// Sleep unless shutdown is requested; false means shutdown
    async fn interruptible_sleep(&mut self, delay_ms: u64) -> bool {
        tokio::select! {
            changed = self.shutdown_rx.changed() => {
                if changed.is_err() || *self.shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Flush a queued Disconnect to the broker
    async fn drain(&mut self) {
        let flushed = tokio::time::timeout(DRAIN_TIMEOUT, async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;

        if flushed.is_err() {
            debug!("Disconnect not flushed before timeout");
        }
        self.set_state(HealthMonitor::determine_next_state(
            TransportEvent::DisconnectedByBroker,
        ));
    }
}
