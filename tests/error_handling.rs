mod common;

use common::{init_tracing, test_config, Harness};
use mqtt_session::transport::mock::MockBootstrap;
use mqtt_session::{
    Client, ConnectionCallbacks, ConnectionState, QoS, SessionConfig, SessionError, Will,
};
use std::time::Duration;

#[tokio::test]
async fn test_disconnect_fails_pending_before_resolving() {
    let harness = Harness::connected(test_config("flush"), ConnectionCallbacks::new()).await;
    let connection = &harness.connection;

    let mut publishes = Vec::new();
    for i in 0..5 {
        let (handle, _) = connection
            .publish(&format!("t/{i}"), &b"x"[..], QoS::AtLeastOnce, false)
            .unwrap();
        publishes.push(handle);
    }
    let (mut subscribe, _) = connection.subscribe("a/#", QoS::AtLeastOnce, |_| {}).unwrap();
    let (mut unsubscribe, _) = connection.unsubscribe("b/#").unwrap();
    let mut ping = connection.ping().unwrap();
    assert_eq!(connection.outstanding_operations(), 7);

    let disconnect = connection.disconnect(true);

    // Everything outstanding is already resolved when disconnect returns
    for handle in &mut publishes {
        assert!(handle.try_result().unwrap().unwrap_err().is_connection_closed());
    }
    assert!(subscribe.try_result().unwrap().unwrap_err().is_connection_closed());
    assert!(unsubscribe.try_result().unwrap().unwrap_err().is_connection_closed());
    assert!(ping.try_result().unwrap().unwrap_err().is_connection_closed());
    assert_eq!(connection.outstanding_operations(), 0);

    disconnect.await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Terminated);
}

#[tokio::test]
async fn test_packet_ids_carried_on_failure() {
    let harness = Harness::connected(test_config("ids-on-fail"), ConnectionCallbacks::new()).await;

    let (handle, packet_id) = harness
        .connection
        .publish("t", &b"x"[..], QoS::ExactlyOnce, false)
        .unwrap();
    harness.connection.disconnect(true).await.unwrap();

    match handle.await {
        Err(SessionError::Operation { packet_id: failed, .. }) => assert_eq!(failed, packet_id),
        other => panic!("Expected operation failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_operations_require_connected() {
    init_tracing();
    let (bootstrap, broker) = MockBootstrap::new();
    let client = Client::new(bootstrap);
    let connection = client
        .new_connection(test_config("idle"), ConnectionCallbacks::new())
        .unwrap();

    let expected = |operation: &'static str| SessionError::InvalidState {
        operation,
        state: ConnectionState::Disconnected,
    };
    assert_eq!(
        connection.subscribe("a", QoS::AtMostOnce, |_| {}).unwrap_err(),
        expected("subscribe")
    );
    assert_eq!(connection.unsubscribe("a").unwrap_err(), expected("unsubscribe"));
    assert_eq!(
        connection
            .publish("a", &b"x"[..], QoS::AtMostOnce, false)
            .unwrap_err(),
        expected("publish")
    );
    assert_eq!(connection.ping().unwrap_err(), expected("ping"));
    assert_eq!(broker.connect_attempts(), 0);
}

#[test]
fn test_invalid_configs_rejected_at_construction() {
    let (bootstrap, broker) = MockBootstrap::new();
    let client = Client::new(bootstrap);

    let invalid = [
        SessionConfig::new("c", "localhost", 1883)
            .with_reconnect_backoff(Duration::from_secs(10), Duration::from_secs(1)),
        SessionConfig::new("", "localhost", 1883).with_clean_session(false),
        SessionConfig::new("c", "", 1883),
        SessionConfig::new("c", "localhost", 1883).with_connect_timeout(Duration::ZERO),
        SessionConfig::new("c", "localhost", 1883)
            .with_reconnect_backoff(Duration::ZERO, Duration::from_secs(1)),
        SessionConfig::new("c", "localhost", 1883).with_will(Will::new("status/#", "gone")),
    ];
    for config in invalid {
        assert!(matches!(
            client.new_connection(config, ConnectionCallbacks::new()),
            Err(SessionError::InvalidConfig(_))
        ));
    }
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_blocking_outside_runtime_threads() {
    let mut harness = Harness::connected(test_config("blocking"), ConnectionCallbacks::new()).await;

    let (handle, packet_id) = harness
        .connection
        .publish("t/blocking", &b"x"[..], QoS::AtLeastOnce, false)
        .unwrap();
    let waiter = tokio::task::spawn_blocking(move || handle.wait_blocking());

    harness.session.recv().await.unwrap();
    harness
        .session
        .send(mqtt_session::Packet::PubAck(packet_id.unwrap()));

    let puback = waiter.await.unwrap().unwrap();
    assert_eq!(puback.packet_id, packet_id);
}
