mod common;

use common::{test_config, wait_for_state, EventCounter, Harness};
use mqtt_session::packet::Packet;
use mqtt_session::{ConnectionCallbacks, ConnectionState, SessionError};
use std::time::Duration;

#[tokio::test]
async fn test_idle_connection_sends_pingreq() {
    let mut harness = Harness::connected(
        test_config("idle-ping").with_keep_alive(1),
        ConnectionCallbacks::new(),
    )
    .await;

    for _ in 0..2 {
        assert_eq!(harness.session.recv().await, Some(Packet::PingReq));
        harness.session.send(Packet::PingResp);
    }
    assert_eq!(harness.connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_two_missed_pingresps_interrupt() {
    let interrupted = EventCounter::new();
    let callbacks = {
        let interrupted = interrupted.clone();
        ConnectionCallbacks::new().on_connection_interrupted(move |_| interrupted.increment())
    };
    let mut harness = Harness::connected(
        test_config("missed")
            .with_keep_alive(1)
            .with_connect_timeout(Duration::from_millis(200))
            .with_auto_reconnect(false),
        callbacks,
    )
    .await;

    assert_eq!(harness.session.recv().await, Some(Packet::PingReq));
    tokio::time::sleep(Duration::from_millis(400)).await;
    // One miss is tolerated
    assert_eq!(harness.connection.state(), ConnectionState::Connected);

    assert_eq!(harness.session.recv().await, Some(Packet::PingReq));
    assert!(wait_for_state(&harness.connection, ConnectionState::Interrupted).await);
    assert_eq!(interrupted.get(), 1);
}

#[tokio::test]
async fn test_explicit_ping_timeout_interrupts() {
    let mut harness = Harness::connected(
        test_config("ping-timeout")
            .with_connect_timeout(Duration::from_millis(100))
            .with_auto_reconnect(false),
        ConnectionCallbacks::new(),
    )
    .await;

    let handle = harness.connection.ping().unwrap();
    assert_eq!(harness.session.recv().await, Some(Packet::PingReq));
    assert_eq!(handle.await, Err(SessionError::Timeout));
    assert!(wait_for_state(&harness.connection, ConnectionState::Interrupted).await);
}

#[tokio::test]
async fn test_keepalive_disabled_sends_nothing() {
    let mut harness = Harness::connected(test_config("no-keepalive"), ConnectionCallbacks::new()).await;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(harness.session.try_recv().is_none());
}
