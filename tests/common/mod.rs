//! Common test utilities: a scripted mock broker and message collectors

#![allow(dead_code)]

use mqtt_session::packet::{Packet, SubAckPacket, SubAckReturnCode};
use mqtt_session::transport::mock::{MockBootstrap, MockBroker, MockSession};
use mqtt_session::{
    Client, Connection, ConnectionCallbacks, ConnectionState, Message, QoS, SessionConfig,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default timeout for test waits
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Session config with short timeouts and backoff suited to tests
pub fn test_config(name: &str) -> SessionConfig {
    SessionConfig::new(format!("test-{name}"), "localhost", 1883)
        .with_connect_timeout(Duration::from_secs(1))
        .with_reconnect_backoff(Duration::from_millis(10), Duration::from_millis(40))
}

/// A connection, its mock broker and the live broker-side session
pub struct Harness {
    pub connection: Connection,
    pub broker: MockBroker,
    pub session: MockSession,
}

impl Harness {
    /// Creates a connection and drives it to `Connected`
    pub async fn connected(config: SessionConfig, callbacks: ConnectionCallbacks) -> Self {
        init_tracing();
        let (bootstrap, mut broker) = MockBootstrap::new();
        let client = Client::new(bootstrap);
        let connection = client
            .new_connection(config, callbacks)
            .expect("valid config");

        let connect = connection.connect().expect("connect allowed");
        let mut session = broker.accept().await.expect("transport session");
        session
            .accept_connect(false)
            .await
            .expect("CONNECT received");
        let connack = connect.await.expect("connect accepted");
        assert!(!connack.session_present);
        assert_eq!(connection.state(), ConnectionState::Connected);

        Self {
            connection,
            broker,
            session,
        }
    }

    /// Accepts the next transport session and completes its CONNECT handshake
    pub async fn accept_reconnect(&mut self, session_present: bool) {
        let mut session = self.broker.accept().await.expect("reconnect session");
        session
            .accept_connect(session_present)
            .await
            .expect("CONNECT on reconnect");
        self.session = session;
    }

    /// Subscribes and confirms with the requested QoS
    pub async fn subscribe(&mut self, filter: &str, qos: QoS, collector: &MessageCollector) {
        let (handle, packet_id) = self
            .connection
            .subscribe(filter, qos, collector.callback())
            .expect("subscribe allowed");
        match self.session.recv().await {
            Some(Packet::Subscribe(subscribe)) => assert_eq!(subscribe.packet_id, packet_id),
            other => panic!("Expected SUBSCRIBE, got {other:?}"),
        }
        self.session.send(Packet::SubAck(SubAckPacket {
            packet_id,
            return_codes: vec![SubAckReturnCode::Granted(qos)],
        }));
        handle.await.expect("subscription granted");
    }
}

/// Collects messages delivered to a subscription callback
#[derive(Clone, Default)]
pub struct MessageCollector {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl MessageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a callback function for subscriptions
    pub fn callback(&self) -> impl Fn(Message) + Send + Sync + 'static {
        let messages = Arc::clone(&self.messages);
        move |msg| messages.lock().unwrap().push(msg)
    }

    /// Wait for a specific number of messages
    pub async fn wait_for_messages(&self, count: usize, timeout: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if self.count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

/// Counts callback invocations
#[derive(Clone, Default)]
pub struct EventCounter {
    count: Arc<AtomicU32>,
}

impl EventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

/// Polls until the connection reaches `state`
pub async fn wait_for_state(connection: &Connection, state: ConnectionState) -> bool {
    wait_until(|| connection.state() == state).await
}

/// Polls `condition` until it holds or the default timeout passes
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < DEFAULT_TIMEOUT {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Sends a broker-side PUBLISH to the client
pub fn deliver(session: &MockSession, topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>) {
    session.send(Packet::Publish(mqtt_session::packet::PublishPacket {
        topic_name: topic.to_string(),
        packet_id,
        payload: bytes::Bytes::from_static(payload),
        qos,
        retain: false,
        dup: false,
    }));
}
