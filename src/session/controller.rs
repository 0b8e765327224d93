//! Session controller: Locate → Connect → Subscribe → Serve
//!
//! The controller is a single actor task. Commands from [`SessionHandle`]s and events
//! from discovery, the transport and timers arrive on two channels and are processed
//! one at a time, so [`SessionState`], the broker address and the subscription table
//! are only ever touched from this task.

use crate::config::BrokerLinkConfig;
use crate::discovery::{BrokerAddress, BrowseHandle, DiscoveryBackend, DiscoveryEvent, ServiceLocator};
use crate::error::{sanitize_error_message, ConnectError, PublishError, SessionError, SessionResult};
use crate::session::events::{
    ConnectionEvent, EventPayload, EventSink, InboundMessage, Notification, Notifier, SessionEvent,
    Ticket,
};
use crate::session::router::{Dispatch, MessageRouter, PublishRequest};
use crate::session::state::{ConnectFailureDecision, RetryBudget, SessionState};
use crate::session::subscription::{Subscription, SubscriptionManager};
use crate::transport::mqtt::ReconnectConfig;
use crate::transport::Connection;
use rumqttc::QoS;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 256;

/// Requests from [`SessionHandle`] to the controller task
#[derive(Debug)]
pub enum SessionCommand {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    Publish {
        request: PublishRequest,
        reply: oneshot::Sender<Result<(), PublishError>>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Point-in-time view of the session for observability
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub address: Option<BrokerAddress>,
    pub subscriptions: Vec<Subscription>,
    pub connect_attempts: u32,
    pub relocate_cycles: u32,
    pub discovery_failures: u32,
}

/// Cloneable, thread-safe handle to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionState>,
    failure_rx: watch::Receiver<Option<String>>,
    notifier: Notifier,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> SessionResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| SessionError::ControllerGone)?;
        reply_rx.await.map_err(|_| SessionError::ControllerGone)
    }

    /// Begin locating a broker. Allowed from Idle and, as a manual restart, from Failed.
    pub async fn start(&self) -> SessionResult<()> {
        self.request(SessionCommand::Start).await
    }

    /// Cancel discovery, close the connection and return to Idle
    pub async fn stop(&self) -> SessionResult<()> {
        self.request(SessionCommand::Stop).await
    }

    /// Stop and end the controller task
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.request(SessionCommand::Shutdown).await
    }

    /// Publish without waiting for delivery; fails with `NotConnected` unless Ready
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
    ) -> SessionResult<()> {
        let request = PublishRequest::new(topic, payload, qos);
        self.request(|reply| SessionCommand::Publish { request, reply })
            .await?
            .map_err(SessionError::from)
    }

    /// Publish `"1"` or `"0"` to `<group>/<device>`
    pub async fn publish_device_state(
        &self,
        group: &str,
        device: &str,
        on: bool,
    ) -> SessionResult<()> {
        let request = PublishRequest::device_state(group, device, on);
        self.request(|reply| SessionCommand::Publish { request, reply })
            .await?
            .map_err(SessionError::from)
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch channel of the session state
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Reason of the most recent failure while the session is Failed
    pub fn failure_reason(&self) -> Option<String> {
        self.failure_rx.borrow().clone()
    }

    /// Wait until the session reaches `target`.
    ///
    /// Returns [`SessionError::Failed`] as soon as the session fails, unless Failed is
    /// the target. The watch channel only keeps the latest value; use
    /// [`SessionHandle::notifications`] to observe every transition.
    pub async fn wait_for_state(&self, target: SessionState, timeout: Duration) -> SessionResult<()> {
        let mut state_rx = self.state_rx.clone();
        let wait = async {
            loop {
                let state = *state_rx.borrow_and_update();
                if state == target {
                    return Ok(());
                }
                if state == SessionState::Failed {
                    let reason = self
                        .failure_reason()
                        .unwrap_or_else(|| "session failed".to_string());
                    return Err(SessionError::Failed(reason));
                }
                if state_rx.changed().await.is_err() {
                    return Err(SessionError::ControllerGone);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SessionError::StateTimeout(target))?
    }

    /// Advisory notifications emitted after this call, in emission order
    pub fn notifications(&self) -> mpsc::UnboundedReceiver<Notification> {
        self.notifier.subscribe()
    }

    pub async fn snapshot(&self) -> SessionResult<SessionSnapshot> {
        self.request(SessionCommand::Snapshot).await
    }
}

/// Next step of a lifecycle sequence. Steps are driven in a loop rather than by
/// recursion so one event can walk through several transitions.
#[derive(Debug)]
enum Step {
    Locate,
    Connect,
    Relocate,
    Fail(String),
    Done,
}

/// The session state machine
pub struct SessionController<B: DiscoveryBackend, C: Connection> {
    config: BrokerLinkConfig,
    locator: ServiceLocator<B>,
    connection: C,
    subscriptions: SubscriptionManager,
    router: MessageRouter,
    budget: RetryBudget,
    locate_backoff: ReconnectConfig,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    failure_tx: watch::Sender<Option<String>>,
    address: Option<BrokerAddress>,
    browse: Option<BrowseHandle>,
    notifier: Notifier,
    commands: mpsc::Receiver<SessionCommand>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    next_ticket: Ticket,
    discovery_ticket: Ticket,
    connection_ticket: Ticket,
    subscribe_ticket: Ticket,
    retry_ticket: Ticket,
    subscribe_timer: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

impl<B: DiscoveryBackend, C: Connection> SessionController<B, C> {
    pub fn new(config: BrokerLinkConfig, backend: B, connection: C) -> (Self, SessionHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (failure_tx, failure_rx) = watch::channel(None);
        let notifier = Notifier::new();

        let controller = Self {
            subscriptions: SubscriptionManager::new(
                config.topics.subscription_set(),
                config.topics.qos_level(),
            ),
            router: MessageRouter::from_topics(&config.topics),
            budget: RetryBudget::new(&config.retry, &config.discovery),
            locate_backoff: ReconnectConfig::from_retry(&config.retry),
            locator: ServiceLocator::new(backend),
            connection,
            config,
            state: SessionState::Idle,
            state_tx,
            failure_tx,
            address: None,
            browse: None,
            notifier: notifier.clone(),
            commands,
            events_tx,
            events_rx,
            next_ticket: 0,
            discovery_ticket: 0,
            connection_ticket: 0,
            subscribe_ticket: 0,
            retry_ticket: 0,
            subscribe_timer: None,
            retry_timer: None,
        };

        let handle = SessionHandle {
            commands: commands_tx,
            state_rx,
            failure_rx,
            notifier,
        };

        (controller, handle)
    }

    /// Build a controller and run it on the current runtime
    pub fn spawn(config: BrokerLinkConfig, backend: B, connection: C) -> SessionHandle {
        let span = crate::session_span!(client_id = %config.session.client_id);
        let (controller, handle) = Self::new(config, backend, connection);
        tokio::spawn(controller.run().instrument(span));
        handle
    }

    /// Process commands and events until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!("Session controller started");

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown(reply)) => {
                        self.stop().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            }
        }

        info!("Session controller stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start(reply) => {
                if self.state.can_start() {
                    info!(from = %self.state, "Starting session");
                    self.budget.reset();
                    self.failure_tx.send_replace(None);
                    self.drive(Step::Locate).await;
                } else {
                    debug!(state = %self.state, "Start ignored, session already running");
                }
                let _ = reply.send(());
            }
            SessionCommand::Stop(reply) => {
                self.stop().await;
                let _ = reply.send(());
            }
            SessionCommand::Publish { request, reply } => {
                let _ = reply.send(self.publish(&request));
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop
            SessionCommand::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            address: self.address.clone(),
            subscriptions: self.subscriptions.entries().to_vec(),
            connect_attempts: self.budget.connect_attempts(),
            relocate_cycles: self.budget.relocate_cycles(),
            discovery_failures: self.budget.discovery_failures(),
        }
    }

    fn publish(&self, request: &PublishRequest) -> Result<(), PublishError> {
        if !self.state.accepts_publish() {
            warn!(topic = %request.topic, state = %self.state, "Publish rejected, not connected");
            self.notifier.notify(Notification::NotConnected {
                topic: request.topic.clone(),
            });
            return Err(PublishError::NotConnected);
        }

        match self.router.publish(&self.connection, request) {
            Ok(()) => {
                debug!(topic = %request.topic, bytes = request.payload.len(), "Published");
                Ok(())
            }
            Err(PublishError::NotConnected) => {
                self.notifier.notify(Notification::NotConnected {
                    topic: request.topic.clone(),
                });
                Err(PublishError::NotConnected)
            }
            Err(e) => {
                warn!(topic = %request.topic, "Publish failed: {}", e);
                self.notifier.notify(Notification::PublishFailed {
                    topic: request.topic.clone(),
                    reason: sanitize_error_message(&e.to_string()),
                });
                Err(e)
            }
        }
    }

    fn issue_ticket(&mut self) -> Ticket {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn is_current(&self, event: &SessionEvent) -> bool {
        let current = match event.payload {
            EventPayload::Discovery(_) => self.discovery_ticket,
            EventPayload::Connection(_) => self.connection_ticket,
            EventPayload::SubscribeDeadline => self.subscribe_ticket,
            EventPayload::RetryLocate => self.retry_ticket,
        };
        current != 0 && event.ticket == current
    }

    fn invalidate_tickets(&mut self) {
        self.discovery_ticket = 0;
        self.connection_ticket = 0;
        self.subscribe_ticket = 0;
        self.retry_ticket = 0;
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        let from = self.state;
        info!(from = %from, to = %next, "Session state transition");

        self.state = next;
        if !next.holds_subscriptions() {
            self.subscriptions.clear();
        }
        self.state_tx.send_replace(next);
        self.notifier
            .notify(Notification::StateChanged { from, to: next });
    }

    fn arm_timer(&self, ticket: Ticket, delay: Duration, payload: EventPayload) -> JoinHandle<()> {
        let sink = EventSink::new(ticket, self.events_tx.clone());
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.emit(payload).await;
        })
    }

    fn cancel_timers(&mut self) {
        for timer in [self.subscribe_timer.take(), self.retry_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }

    fn cancel_browse(&mut self) {
        if let Some(browse) = self.browse.take() {
            browse.cancel();
            self.notifier.notify(Notification::DiscoveryStopped);
        }
        self.discovery_ticket = 0;
    }

    async fn close_connection(&mut self) {
        self.connection_ticket = 0;
        self.subscribe_ticket = 0;
        if let Some(timer) = self.subscribe_timer.take() {
            timer.abort();
        }
        self.connection.disconnect().await;
    }

    async fn stop(&mut self) {
        if self.state == SessionState::Idle && self.browse.is_none() {
            return;
        }
        info!(state = %self.state, "Stopping session");
        self.cancel_timers();
        self.cancel_browse();
        self.invalidate_tickets();
        self.connection.disconnect().await;
        self.address = None;
        self.transition(SessionState::Idle);
    }

    async fn drive(&mut self, mut step: Step) {
        loop {
            step = match step {
                Step::Locate => self.begin_locate().await,
                Step::Connect => self.begin_connect().await,
                Step::Relocate => self.relocate().await,
                Step::Fail(reason) => {
                    self.fail(reason).await;
                    Step::Done
                }
                Step::Done => break,
            };
        }
    }

    async fn begin_locate(&mut self) -> Step {
        self.cancel_browse();
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        self.address = None;
        self.transition(SessionState::Locating);

        self.discovery_ticket = self.issue_ticket();
        let sink = EventSink::new(self.discovery_ticket, self.events_tx.clone());
        let service_type = self.config.discovery.service_type.clone();

        match self.locator.browse(&service_type, sink).await {
            Ok(browse) => {
                self.browse = Some(browse);
                Step::Done
            }
            Err(e) => {
                self.discovery_ticket = 0;
                self.on_discovery_failure(e.to_string())
            }
        }
    }

    fn on_discovery_failure(&mut self, reason: String) -> Step {
        warn!("Discovery failed: {}", reason);
        self.notifier.notify(Notification::DiscoveryFailed {
            reason: sanitize_error_message(&reason),
        });

        if self.budget.on_discovery_failure() {
            return Step::Fail(format!(
                "Discovery failed {} times: {}",
                self.budget.discovery_failures(),
                reason
            ));
        }

        let delay = Duration::from_millis(
            self.locate_backoff
                .calculate_backoff_delay(self.budget.discovery_failures()),
        );
        info!(delay_ms = delay.as_millis() as u64, "Retrying discovery after backoff");
        self.retry_ticket = self.issue_ticket();
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        self.retry_timer = Some(self.arm_timer(self.retry_ticket, delay, EventPayload::RetryLocate));
        Step::Done
    }

    async fn begin_connect(&mut self) -> Step {
        let Some(address) = self.address.clone() else {
            return Step::Locate;
        };
        self.transition(SessionState::Connecting);

        let attempt = self.budget.on_connect_attempt();
        self.connection_ticket = self.issue_ticket();
        let sink = EventSink::new(self.connection_ticket, self.events_tx.clone());
        info!(broker = %address, attempt, "Connecting to broker");

        match self
            .connection
            .connect(&address, &self.config.session, sink)
            .await
        {
            Ok(()) => Step::Done,
            Err(e) => self.on_connect_failure(e).await,
        }
    }

    async fn on_connect_failure(&mut self, error: ConnectError) -> Step {
        let attempt = self.budget.connect_attempts();
        warn!(attempt, "Connect attempt failed: {}", error);
        self.notifier.notify(Notification::ConnectFailed {
            reason: sanitize_error_message(&error.to_string()),
            attempt,
        });
        self.close_connection().await;

        if error.is_permanent() {
            return Step::Fail(format!("Broker rejected the session: {error}"));
        }
        if matches!(error, ConnectError::InvalidAddress(_)) {
            return Step::Relocate;
        }
        match self.budget.on_connect_failure() {
            ConnectFailureDecision::RetrySameAddress { attempt } => {
                debug!(attempt, "Retrying same address");
                Step::Connect
            }
            ConnectFailureDecision::Relocate => Step::Relocate,
        }
    }

    async fn relocate(&mut self) -> Step {
        self.close_connection().await;
        if !self.budget.on_relocate() {
            return Step::Fail(format!(
                "Broker unreachable after {} rediscovery cycles",
                self.config.retry.max_relocate_cycles
            ));
        }
        info!(
            cycle = self.budget.relocate_cycles(),
            "Falling back to broker rediscovery"
        );
        Step::Locate
    }

    async fn fail(&mut self, reason: String) {
        error!("Session failed: {}", reason);
        self.cancel_timers();
        self.cancel_browse();
        self.invalidate_tickets();
        self.connection.disconnect().await;

        let reason = sanitize_error_message(&reason);
        // Published before the state so waiters observing Failed can read it
        self.failure_tx.send_replace(Some(reason.clone()));
        self.transition(SessionState::Failed);
        self.notifier.notify(Notification::Failed { reason });
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        if !self.is_current(&event) {
            debug!(ticket = event.ticket, "Discarding stale event");
            return;
        }

        let step = match event.payload {
            EventPayload::Discovery(event) => self.on_discovery_event(event),
            EventPayload::Connection(event) => self.on_connection_event(event).await,
            EventPayload::SubscribeDeadline => {
                self.on_subscribe_deadline();
                Step::Done
            }
            EventPayload::RetryLocate => {
                self.retry_timer = None;
                if self.state == SessionState::Locating {
                    Step::Locate
                } else {
                    Step::Done
                }
            }
        };
        self.drive(step).await;
    }

    fn on_discovery_event(&mut self, event: DiscoveryEvent) -> Step {
        match event {
            DiscoveryEvent::BrowseStarted { service_type } => {
                self.notifier
                    .notify(Notification::DiscoveryStarted { service_type });
                Step::Done
            }
            DiscoveryEvent::AddressFound(address) => {
                info!(broker = %address, "Broker address resolved");
                self.notifier.notify(Notification::AddressFound {
                    address: address.clone(),
                });
                if self.state != SessionState::Locating {
                    debug!(broker = %address, state = %self.state, "Additional advertisement ignored");
                    return Step::Done;
                }
                self.address = Some(address);
                self.budget.on_address();
                Step::Connect
            }
            DiscoveryEvent::ResolveFailed(e) => {
                self.notifier.notify(Notification::ResolveFailed {
                    reason: sanitize_error_message(&e.to_string()),
                });
                if self.state == SessionState::Locating && self.budget.on_discovery_failure() {
                    return Step::Fail(format!("Too many discovery failures: {e}"));
                }
                Step::Done
            }
            DiscoveryEvent::AddressLost(address) => {
                self.notifier.notify(Notification::AddressLost {
                    address: address.clone(),
                });
                if self.address.as_ref() != Some(&address) {
                    return Step::Done;
                }
                match self.state {
                    SessionState::Connecting | SessionState::Disconnected => {
                        info!(broker = %address, "Current broker withdrawn, relocating");
                        Step::Relocate
                    }
                    _ => {
                        warn!(broker = %address, "Current broker advertisement withdrawn");
                        Step::Done
                    }
                }
            }
            DiscoveryEvent::BrowseStopped => {
                self.browse = None;
                self.discovery_ticket = 0;
                self.notifier.notify(Notification::DiscoveryStopped);
                if self.state == SessionState::Locating {
                    self.on_discovery_failure("Browse ended before a broker was found".to_string())
                } else {
                    Step::Done
                }
            }
        }
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) -> Step {
        match event {
            ConnectionEvent::Established { session_present } => {
                if !matches!(
                    self.state,
                    SessionState::Connecting
                        | SessionState::Disconnected
                        | SessionState::Connected
                        | SessionState::Subscribing
                        | SessionState::Ready
                ) {
                    return Step::Done;
                }
                if self.state == SessionState::Disconnected {
                    info!("Transport reconnected");
                }
                self.transition(SessionState::Connected);
                if let Some(address) = self.address.clone() {
                    self.notifier.notify(Notification::Connected {
                        address,
                        session_present,
                    });
                }
                self.begin_subscribe();
                Step::Done
            }
            ConnectionEvent::ConnectFailed(e) => match self.state {
                SessionState::Connecting => self.on_connect_failure(e).await,
                SessionState::Disconnected if e.is_permanent() => {
                    self.notifier.notify(Notification::ConnectFailed {
                        reason: sanitize_error_message(&e.to_string()),
                        attempt: self.budget.connect_attempts(),
                    });
                    self.close_connection().await;
                    Step::Fail(format!("Broker rejected the reconnect: {e}"))
                }
                _ => Step::Done,
            },
            ConnectionEvent::Lost(reason) => {
                if !matches!(
                    self.state,
                    SessionState::Connected | SessionState::Subscribing | SessionState::Ready
                ) {
                    return Step::Done;
                }
                warn!("Connection lost: {}", reason);
                self.subscribe_ticket = 0;
                if let Some(timer) = self.subscribe_timer.take() {
                    timer.abort();
                }
                self.transition(SessionState::Disconnected);
                self.notifier.notify(Notification::ConnectionLost {
                    reason: sanitize_error_message(&reason),
                });
                if self.config.session.automatic_reconnect {
                    Step::Done
                } else {
                    Step::Relocate
                }
            }
            ConnectionEvent::ReconnectExhausted(reason) => {
                if self.state == SessionState::Disconnected {
                    warn!("Automatic reconnect exhausted: {}", reason);
                    Step::Relocate
                } else {
                    Step::Done
                }
            }
            ConnectionEvent::MessageArrived(message) => {
                self.on_message(message);
                Step::Done
            }
            ConnectionEvent::SubscribeAck { topic, result } => {
                self.on_subscribe_ack(topic, result);
                Step::Done
            }
        }
    }

    fn on_message(&mut self, message: InboundMessage) {
        if !self.state.receives_messages() {
            debug!(topic = %message.topic, state = %self.state, "Dropping message outside a live connection");
            return;
        }

        match self.router.on_message(message) {
            Dispatch::Command { topic, command } => {
                info!(topic = %topic, ?command, "Control command");
                self.notifier
                    .notify(Notification::Command { topic, command });
            }
            Dispatch::Forward(message) => {
                self.notifier.notify(Notification::Message { message });
            }
            Dispatch::Ignored { .. } => {}
        }
    }

    fn begin_subscribe(&mut self) {
        self.transition(SessionState::Subscribing);
        self.subscribe_ticket = self.issue_ticket();
        if let Some(timer) = self.subscribe_timer.take() {
            timer.abort();
        }

        let outcomes = self.subscriptions.subscribe_all(&self.connection);
        for (topic, result) in outcomes {
            if let Err(e) = result {
                self.notifier.notify(Notification::SubscribeFailed {
                    topic,
                    reason: sanitize_error_message(&e.to_string()),
                });
            }
        }

        if self.subscriptions.all_resolved() {
            self.become_ready();
        } else {
            self.subscribe_timer = Some(self.arm_timer(
                self.subscribe_ticket,
                self.config.session.connect_timeout(),
                EventPayload::SubscribeDeadline,
            ));
        }
    }

    fn on_subscribe_ack(&mut self, topic: String, result: Result<(), crate::error::SubscribeError>) {
        if self.state != SessionState::Subscribing {
            debug!(topic = %topic, "Late subscription acknowledgment ignored");
            return;
        }
        if !self.subscriptions.acknowledge(&topic, &result) {
            return;
        }

        match result {
            Ok(()) => self.notifier.notify(Notification::Subscribed { topic }),
            Err(e) => {
                warn!(topic = %topic, "Subscription failed: {}", e);
                self.notifier.notify(Notification::SubscribeFailed {
                    topic,
                    reason: sanitize_error_message(&e.to_string()),
                });
            }
        }

        if self.subscriptions.all_resolved() {
            self.become_ready();
        }
    }

    fn on_subscribe_deadline(&mut self) {
        self.subscribe_timer = None;
        if self.state != SessionState::Subscribing {
            return;
        }
        for e in self.subscriptions.expire_pending() {
            warn!("{}", e);
            self.notifier.notify(Notification::SubscribeFailed {
                topic: e.topic().to_string(),
                reason: e.to_string(),
            });
        }
        self.become_ready();
    }

    fn become_ready(&mut self) {
        if let Some(timer) = self.subscribe_timer.take() {
            timer.abort();
        }
        self.budget.reset();
        let active = self.subscriptions.active_count();
        let total = self.subscriptions.topics().len();
        if active == 0 {
            warn!("No subscription succeeded, inbound traffic will not arrive");
        }
        info!(active, total, "Session ready");
        self.transition(SessionState::Ready);
    }
}
