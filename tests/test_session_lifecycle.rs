//! Session lifecycle tests
//!
//! Drive the controller end to end through mock discovery and a mock connection and
//! check the observable outcome: state transitions, notifications and transport calls.


use brokerlink::discovery::BrokerAddress;
use brokerlink::error::{ConnectError, PublishError, SessionError};
use brokerlink::session::{AckState, ConnectionEvent, Notification, SessionState};
use brokerlink::testing::{ConnectOutcome, MockConnection, MockDiscoveryBackend};
use rumqttc::QoS;
use std::time::Duration;
use test_helpers::*;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_discovers_connects_subscribes_and_publishes() {
    let mut session = spawn_session(test_config(), broker_backend(), MockConnection::new());

    let seen = session.start_ready().await;

    assert_eq!(
        transitions(&seen),
        vec![
            (SessionState::Idle, SessionState::Locating),
            (SessionState::Locating, SessionState::Connecting),
            (SessionState::Connecting, SessionState::Connected),
            (SessionState::Connected, SessionState::Subscribing),
            (SessionState::Subscribing, SessionState::Ready),
        ]
    );
    assert_eq!(
        session.connection.connect_calls(),
        vec![BrokerAddress::new("192.168.1.42", 1883)]
    );
    assert!(!session.connection.connect_configs()[0].clean_session);
    assert_eq!(
        session.connection.subscribe_calls(),
        vec!["DAQ", "esp/devices"]
    );

    assert_ok!(
        session
            .handle
            .publish("group1/lamp", "1", QoS::AtMostOnce)
            .await
    );
    assert_eq!(
        session.connection.sent_messages(),
        vec![("group1/lamp".to_string(), b"1".to_vec())]
    );
}

#[tokio::test]
async fn test_browse_started_is_reported_before_address() {
    let mut session = spawn_session(test_config(), broker_backend(), MockConnection::new());
    let seen = session.start_ready().await;

    let started = seen
        .iter()
        .position(|n| matches!(n, Notification::DiscoveryStarted { .. }))
        .expect("discovery started notification");
    let found = seen
        .iter()
        .position(|n| matches!(n, Notification::AddressFound { .. }))
        .expect("address found notification");
    assert!(started < found);
}

#[tokio::test]
async fn test_publish_before_ready_fails_without_transport_io() {
    let mut session = spawn_session(test_config(), MockDiscoveryBackend::new(), MockConnection::new());

    let result = session
        .handle
        .publish("group1/lamp", "1", QoS::AtMostOnce)
        .await;
    assert!(matches!(
        result,
        Err(SessionError::Publish(PublishError::NotConnected))
    ));

    session.handle.start().await.unwrap();
    session.wait_for_transition(SessionState::Locating).await;

    let result = session.handle.publish_device_state("group1", "lamp", true).await;
    assert!(matches!(
        result,
        Err(SessionError::Publish(PublishError::NotConnected))
    ));

    assert_eq!(session.connection.send_attempts(), 0);
    let seen = session.drain().await;
    assert!(seen
        .iter()
        .any(|n| matches!(n, Notification::NotConnected { topic } if topic == "group1/lamp")));
}

#[tokio::test]
async fn test_repeated_connect_timeouts_end_in_failed() {
    let mut config = test_config();
    config.retry.max_connect_attempts = 3;
    config.retry.max_relocate_cycles = 1;

    let connection = MockConnection::new();
    connection.script_connects(
        std::iter::repeat(ConnectOutcome::Fail(ConnectError::Timeout(Duration::from_secs(10))))
            .take(6),
    );
    let mut session = spawn_session(config, broker_backend(), connection);

    session.handle.start().await.unwrap();
    let seen = session.wait_for_transition(SessionState::Failed).await;

    assert_eq!(
        transitions(&seen),
        vec![
            (SessionState::Idle, SessionState::Locating),
            (SessionState::Locating, SessionState::Connecting),
            (SessionState::Connecting, SessionState::Locating),
            (SessionState::Locating, SessionState::Connecting),
            (SessionState::Connecting, SessionState::Failed),
        ]
    );
    let failures = seen
        .iter()
        .filter(|n| matches!(n, Notification::ConnectFailed { .. }))
        .count();
    assert_eq!(failures, 6);
    assert_eq!(session.connection.connect_calls().len(), 6);
    assert_eq!(session.backend.browse_count(), 2);

    let trailing = session.drain().await;
    assert!(trailing
        .iter()
        .any(|n| matches!(n, Notification::Failed { .. })));
    assert_eq!(session.handle.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_rejected_credentials_fail_without_retry() {
    let connection = MockConnection::new();
    connection.script_connects(
        std::iter::repeat(ConnectOutcome::Refuse(ConnectError::Rejected(
            "NotAuthorized".to_string(),
        )))
        .take(12),
    );
    let mut session = spawn_session(test_config(), broker_backend(), connection);

    session.handle.start().await.unwrap();
    let seen = session.wait_for_transition(SessionState::Failed).await;

    assert_eq!(
        transitions(&seen),
        vec![
            (SessionState::Idle, SessionState::Locating),
            (SessionState::Locating, SessionState::Connecting),
            (SessionState::Connecting, SessionState::Failed),
        ]
    );
    assert_eq!(session.connection.connect_calls().len(), 1);
    assert_eq!(session.backend.browse_count(), 1);
    assert_eq!(session.backend.stop_count(), 1);

    let trailing = session.drain().await;
    assert!(trailing
        .iter()
        .any(|n| matches!(n, Notification::Failed { reason } if reason.contains("NotAuthorized"))));
}

#[tokio::test]
async fn test_rejection_reported_by_transport_is_terminal() {
    let connection = MockConnection::new();
    connection.script_connects([ConnectOutcome::Fail(ConnectError::Rejected(
        "BadUserNamePassword".to_string(),
    ))]);
    let mut session = spawn_session(test_config(), broker_backend(), connection);

    session.handle.start().await.unwrap();
    let seen = session.wait_for_transition(SessionState::Failed).await;

    assert_eq!(
        transitions(&seen).last(),
        Some(&(SessionState::Connecting, SessionState::Failed))
    );
    assert_eq!(session.connection.connect_calls().len(), 1);
}

#[tokio::test]
async fn test_rejected_reconnect_is_terminal() {
    let mut session = spawn_session(test_config(), broker_backend(), MockConnection::new());
    session.start_ready().await;

    session.connection.drop_connection("link down").await;
    session.wait_for_transition(SessionState::Disconnected).await;
    session
        .connection
        .inject(ConnectionEvent::ConnectFailed(ConnectError::Rejected(
            "NotAuthorized".to_string(),
        )))
        .await;

    let seen = session.wait_for_transition(SessionState::Failed).await;
    assert_eq!(
        transitions(&seen),
        vec![(SessionState::Disconnected, SessionState::Failed)]
    );
    assert_eq!(session.connection.connect_calls().len(), 1);
    assert_eq!(session.backend.browse_count(), 1);
}

#[tokio::test]
async fn test_wait_for_state_returns_failure_reason() {
    let connection = MockConnection::new();
    connection.script_connects([ConnectOutcome::Refuse(ConnectError::Rejected(
        "NotAuthorized".to_string(),
    ))]);
    let session = spawn_session(test_config(), broker_backend(), connection);

    session.handle.start().await.unwrap();
    let result = session
        .handle
        .wait_for_state(SessionState::Ready, Duration::from_secs(30))
        .await;

    match result {
        Err(SessionError::Failed(reason)) => assert!(reason.contains("NotAuthorized")),
        other => panic!("expected session failure, got {other:?}"),
    }
    assert!(session.handle.failure_reason().is_some());

    session.handle.start().await.unwrap();
    assert_ok!(
        session
            .handle
            .wait_for_state(SessionState::Ready, Duration::from_secs(5))
            .await
    );
    assert_eq!(session.handle.failure_reason(), None);
}

#[tokio::test]
async fn test_refused_connect_retries_same_address() {
    let connection = MockConnection::new();
    connection.script_connects([ConnectOutcome::Refuse(ConnectError::Refused(
        "server unavailable".to_string(),
    ))]);
    let mut session = spawn_session(test_config(), broker_backend(), connection);

    let seen = session.start_ready().await;

    assert_eq!(session.connection.connect_calls().len(), 2);
    assert_eq!(session.backend.browse_count(), 1);
    assert!(seen
        .iter()
        .any(|n| matches!(n, Notification::ConnectFailed { attempt: 1, .. })));
}

#[tokio::test]
async fn test_failed_session_can_be_restarted() {
    let mut config = test_config();
    config.retry.max_connect_attempts = 1;
    config.retry.max_relocate_cycles = 1;

    let connection = MockConnection::new();
    connection.script_connects(
        std::iter::repeat(ConnectOutcome::Refuse(ConnectError::Refused("down".to_string()))).take(2),
    );
    let mut session = spawn_session(config, broker_backend(), connection);

    session.handle.start().await.unwrap();
    session.wait_for_transition(SessionState::Failed).await;

    let seen = session.start_ready().await;
    assert_eq!(
        transitions(&seen).first(),
        Some(&(SessionState::Failed, SessionState::Locating))
    );
}

#[tokio::test]
async fn test_stop_while_locating_discards_late_address() {
    let mut session = spawn_session(test_config(), MockDiscoveryBackend::new(), MockConnection::new());

    session.handle.start().await.unwrap();
    session
        .collect_until(|n| matches!(n, Notification::DiscoveryStarted { .. }))
        .await;

    session.handle.stop().await.unwrap();
    assert_eq!(session.handle.state(), SessionState::Idle);
    assert_eq!(session.backend.stop_count(), 1);

    session
        .backend
        .announce(BROKER_NAME, broker_ip(), BROKER_PORT)
        .await;
    let seen = session.drain().await;

    assert_eq!(session.handle.state(), SessionState::Idle);
    assert!(session.connection.connect_calls().is_empty());
    assert!(!seen
        .iter()
        .any(|n| matches!(n, Notification::AddressFound { .. })));
    assert_eq!(
        transitions(&seen),
        vec![(SessionState::Locating, SessionState::Idle)]
    );
}

#[tokio::test]
async fn test_stop_while_connecting_discards_late_connect() {
    let connection = MockConnection::new();
    connection.script_connects([ConnectOutcome::Pending]);
    let mut session = spawn_session(test_config(), broker_backend(), connection);

    session.handle.start().await.unwrap();
    session.wait_for_transition(SessionState::Connecting).await;

    session.handle.stop().await.unwrap();
    assert!(session.connection.reestablish().await);
    let seen = session.drain().await;

    assert_eq!(session.handle.state(), SessionState::Idle);
    assert!(session.connection.subscribe_calls().is_empty());
    assert_eq!(
        transitions(&seen),
        vec![(SessionState::Connecting, SessionState::Idle)]
    );
}

#[tokio::test]
async fn test_reconnect_resubscribes_every_topic() {
    let mut session = spawn_session(test_config(), broker_backend(), MockConnection::new());
    session.start_ready().await;

    session.connection.drop_connection("connection reset").await;
    session.wait_for_transition(SessionState::Disconnected).await;

    let result = session.handle.publish("group1/lamp", "0", QoS::AtMostOnce).await;
    assert!(matches!(
        result,
        Err(SessionError::Publish(PublishError::NotConnected))
    ));

    session.connection.reestablish().await;
    let seen = session.wait_for_transition(SessionState::Ready).await;

    assert_eq!(
        transitions(&seen),
        vec![
            (SessionState::Disconnected, SessionState::Connected),
            (SessionState::Connected, SessionState::Subscribing),
            (SessionState::Subscribing, SessionState::Ready),
        ]
    );
    assert_eq!(
        session.connection.subscribe_calls(),
        vec!["DAQ", "esp/devices", "DAQ", "esp/devices"]
    );
    assert_eq!(session.connection.connect_calls().len(), 1);
}

#[tokio::test]
async fn test_exhausted_reconnect_falls_back_to_rediscovery() {
    let mut session = spawn_session(test_config(), broker_backend(), MockConnection::new());
    session.start_ready().await;

    session.connection.drop_connection("broker went away").await;
    session.wait_for_transition(SessionState::Disconnected).await;
    session.connection.exhaust_reconnect().await;

    let seen = session.wait_for_transition(SessionState::Ready).await;
    assert_eq!(
        transitions(&seen).first(),
        Some(&(SessionState::Disconnected, SessionState::Locating))
    );
    assert_eq!(session.backend.browse_count(), 2);
    assert_eq!(session.connection.connect_calls().len(), 2);
}

#[tokio::test]
async fn test_loss_without_automatic_reconnect_relocates() {
    let mut config = test_config();
    config.session.automatic_reconnect = false;
    let mut session = spawn_session(config, broker_backend(), MockConnection::new());
    session.start_ready().await;

    session.connection.drop_connection("connection reset").await;
    let seen = session.wait_for_transition(SessionState::Locating).await;

    assert_eq!(
        transitions(&seen),
        vec![
            (SessionState::Ready, SessionState::Disconnected),
            (SessionState::Disconnected, SessionState::Locating),
        ]
    );
}

#[tokio::test]
async fn test_rejected_subscription_still_reaches_ready() {
    let connection = MockConnection::new();
    connection.reject_topic("DAQ");
    let mut session = spawn_session(test_config(), broker_backend(), connection);

    let seen = session.start_ready().await;

    assert!(seen
        .iter()
        .any(|n| matches!(n, Notification::SubscribeFailed { topic, .. } if topic == "DAQ")));
    assert!(seen
        .iter()
        .any(|n| matches!(n, Notification::Subscribed { topic } if topic == "esp/devices")));

    let snapshot = session.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Ready);
    assert_eq!(snapshot.subscriptions[0].state, AckState::Failed);
    assert_eq!(snapshot.subscriptions[1].state, AckState::Active);
}

#[tokio::test]
async fn test_missing_acknowledgment_expires_into_ready() {
    let connection = MockConnection::new();
    connection.withhold_ack("esp/devices");
    let mut session = spawn_session(test_config(), broker_backend(), connection);

    let seen = session.start_ready().await;

    assert!(seen.iter().any(
        |n| matches!(n, Notification::SubscribeFailed { topic, .. } if topic == "esp/devices")
    ));
    let snapshot = session.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.subscriptions[0].state, AckState::Active);
    assert_eq!(snapshot.subscriptions[1].state, AckState::Failed);
}

#[tokio::test]
async fn test_browse_start_failures_are_retried() {
    let backend = broker_backend();
    backend.fail_next_browses(2);
    let mut session = spawn_session(test_config(), backend, MockConnection::new());

    let seen = session.start_ready().await;

    let failures = seen
        .iter()
        .filter(|n| matches!(n, Notification::DiscoveryFailed { .. }))
        .count();
    assert_eq!(failures, 2);
    assert_eq!(session.backend.browse_count(), 3);
}

#[tokio::test]
async fn test_discovery_failure_budget_ends_in_failed() {
    let mut config = test_config();
    config.discovery.max_failures = 3;
    let backend = MockDiscoveryBackend::new();
    backend.fail_next_browses(10);
    let mut session = spawn_session(config, backend, MockConnection::new());

    session.handle.start().await.unwrap();
    session.wait_for_transition(SessionState::Failed).await;

    assert_eq!(session.backend.browse_count(), 3);
    assert!(session.connection.connect_calls().is_empty());
}

#[tokio::test]
async fn test_address_lost_while_connecting_relocates() {
    let connection = MockConnection::new();
    connection.script_connects([ConnectOutcome::Pending]);
    let mut session = spawn_session(test_config(), broker_backend(), connection);

    session.handle.start().await.unwrap();
    session.wait_for_transition(SessionState::Connecting).await;

    session.backend.lose(BROKER_NAME).await;
    let seen = session.wait_for_transition(SessionState::Ready).await;

    assert!(seen
        .iter()
        .any(|n| matches!(n, Notification::AddressLost { .. })));
    assert_eq!(
        transitions(&seen).first(),
        Some(&(SessionState::Connecting, SessionState::Locating))
    );
    assert_eq!(session.connection.connect_calls().len(), 2);
}

#[tokio::test]
async fn test_snapshot_reports_address_and_subscriptions() {
    let mut session = spawn_session(test_config(), broker_backend(), MockConnection::new());
    session.start_ready().await;

    let snapshot = session.handle.snapshot().await.unwrap();

    assert_eq!(snapshot.state, SessionState::Ready);
    assert_eq!(
        snapshot.address,
        Some(BrokerAddress::new("192.168.1.42", 1883))
    );
    let topics: Vec<_> = snapshot.subscriptions.iter().map(|s| s.topic.as_str()).collect();
    assert_eq!(topics, vec!["DAQ", "esp/devices"]);
    assert_eq!(snapshot.connect_attempts, 0);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["state"], "ready");
    assert_eq!(json["address"]["port"], 1883);
}

#[tokio::test]
async fn test_wait_for_state_and_shutdown() {
    let session = spawn_session(test_config(), broker_backend(), MockConnection::new());

    session.handle.start().await.unwrap();
    assert_ok!(
        session
            .handle
            .wait_for_state(SessionState::Ready, Duration::from_secs(5))
            .await
    );

    session.handle.shutdown().await.unwrap();
    assert_eq!(session.handle.state(), SessionState::Idle);
    assert!(session.connection.disconnect_count() >= 1);
    assert!(matches!(
        session.handle.start().await,
        Err(SessionError::ControllerGone)
    ));
}

#[tokio::test]
async fn test_wait_for_state_times_out() {
    let session = spawn_session(test_config(), MockDiscoveryBackend::new(), MockConnection::new());
    session.handle.start().await.unwrap();

    let result = session
        .handle
        .wait_for_state(SessionState::Ready, Duration::from_millis(100))
        .await;
    assert!(matches!(
        result,
        Err(SessionError::StateTimeout(SessionState::Ready))
    ));
}
