//! In-memory transport that lets a test play the broker
//!
//! [`MockBootstrap`] is handed to a [`Client`](crate::Client); every
//! successful `connect` produces a [`MockSession`] on the paired
//! [`MockBroker`]. The session sees exactly the packets the connection
//! writes and can inject packets or sever the stream at will.

use crate::error::{Result, SessionError};
use crate::packet::{ConnAckPacket, ConnectPacket, Packet};
use crate::transport::{Bootstrap, Endpoint, PacketReader, PacketStream, PacketWriter, TlsOptions};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How long broker-side helpers wait before giving up
pub const MOCK_WAIT: Duration = Duration::from_secs(2);

/// Mock transport behavior configuration
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Should connect attempts fail?
    pub fail_connect: bool,
    /// Delay before a connect attempt completes
    pub connect_delay: Duration,
}

struct MockShared {
    behavior: Mutex<MockBehavior>,
    sessions: mpsc::UnboundedSender<MockSession>,
    connect_attempts: AtomicU32,
    last_endpoint: Mutex<Option<Endpoint>>,
    last_tls: Mutex<Option<TlsOptions>>,
}

/// Bootstrap producing in-memory packet streams
#[derive(Clone)]
pub struct MockBootstrap {
    shared: Arc<MockShared>,
}

/// Broker side of a [`MockBootstrap`]
pub struct MockBroker {
    sessions: mpsc::UnboundedReceiver<MockSession>,
    shared: Arc<MockShared>,
}

impl MockBootstrap {
    /// Creates a bootstrap and the broker handle that receives its sessions
    #[must_use]
    pub fn new() -> (Self, MockBroker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            behavior: Mutex::new(MockBehavior::default()),
            sessions: tx,
            connect_attempts: AtomicU32::new(0),
            last_endpoint: Mutex::new(None),
            last_tls: Mutex::new(None),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockBroker {
                sessions: rx,
                shared,
            },
        )
    }
}

#[async_trait]
impl Bootstrap for MockBootstrap {
    async fn connect(&self, endpoint: &Endpoint, tls: Option<&TlsOptions>) -> Result<PacketStream> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        *lock(&self.shared.last_endpoint) = Some(endpoint.clone());
        *lock(&self.shared.last_tls) = tls.cloned();

        let behavior = lock(&self.shared.behavior).clone();
        if !behavior.connect_delay.is_zero() {
            tokio::time::sleep(behavior.connect_delay).await;
        }
        if behavior.fail_connect {
            return Err(SessionError::Transport(format!(
                "connection refused by {}:{}",
                endpoint.host, endpoint.port
            )));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (broker_tx, broker_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let session = MockSession {
            from_client: client_rx,
            to_client: broker_tx,
            closed: Arc::clone(&closed),
        };
        self.shared
            .sessions
            .send(session)
            .map_err(|_| SessionError::Transport("mock broker is gone".to_string()))?;

        Ok(PacketStream {
            reader: Box::new(MockReader { rx: broker_rx }),
            writer: Box::new(MockWriter {
                tx: client_tx,
                closed,
            }),
        })
    }
}

impl MockBroker {
    /// Changes how subsequent connect attempts behave
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *lock(&self.shared.behavior) = behavior;
    }

    /// Number of connect attempts made through the bootstrap
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Endpoint used by the most recent connect attempt
    #[must_use]
    pub fn last_endpoint(&self) -> Option<Endpoint> {
        lock(&self.shared.last_endpoint).clone()
    }

    /// TLS options passed with the most recent connect attempt
    #[must_use]
    pub fn last_tls(&self) -> Option<TlsOptions> {
        lock(&self.shared.last_tls).clone()
    }

    /// Waits for the next transport session
    pub async fn accept(&mut self) -> Option<MockSession> {
        tokio::time::timeout(MOCK_WAIT, self.sessions.recv())
            .await
            .ok()
            .flatten()
    }

    /// Returns a transport session if one is already waiting
    pub fn try_accept(&mut self) -> Option<MockSession> {
        self.sessions.try_recv().ok()
    }
}

/// One transport session, seen from the broker
pub struct MockSession {
    from_client: mpsc::UnboundedReceiver<Packet>,
    to_client: mpsc::UnboundedSender<Result<Packet>>,
    closed: Arc<AtomicBool>,
}

impl MockSession {
    /// Waits for the next packet written by the client
    pub async fn recv(&mut self) -> Option<Packet> {
        tokio::time::timeout(MOCK_WAIT, self.from_client.recv())
            .await
            .ok()
            .flatten()
    }

    /// Returns a packet if the client already wrote one
    pub fn try_recv(&mut self) -> Option<Packet> {
        self.from_client.try_recv().ok()
    }

    /// Waits for CONNECT
    pub async fn expect_connect(&mut self) -> Option<ConnectPacket> {
        match self.recv().await? {
            Packet::Connect(connect) => Some(*connect),
            other => {
                tracing::warn!(packet = other.name(), "Mock broker expected CONNECT");
                None
            }
        }
    }

    /// Waits for CONNECT and accepts it
    pub async fn accept_connect(&mut self, session_present: bool) -> Option<ConnectPacket> {
        let connect = self.expect_connect().await?;
        self.send(Packet::ConnAck(ConnAckPacket::accepted(session_present)));
        Some(connect)
    }

    /// Delivers a packet to the client; false if the client side is gone
    pub fn send(&self, packet: Packet) -> bool {
        self.to_client.send(Ok(packet)).is_ok()
    }

    /// Severs the stream as a network failure would
    pub fn drop_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self
            .to_client
            .send(Err(SessionError::Transport("connection reset".to_string())));
    }

    /// Whether the client closed its end or the stream was severed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockReader {
    rx: mpsc::UnboundedReceiver<Result<Packet>>,
}

#[async_trait]
impl PacketReader for MockReader {
    async fn read_packet(&mut self) -> Result<Packet> {
        self.rx
            .recv()
            .await
            .unwrap_or_else(|| Err(SessionError::Transport("connection closed".to_string())))
    }
}

struct MockWriter {
    tx: mpsc::UnboundedSender<Packet>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl PacketWriter for MockWriter {
    async fn write_packet(&mut self, packet: Packet) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("connection closed".to_string()));
        }
        self.tx
            .send(packet)
            .map_err(|_| SessionError::Transport("connection closed".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "localhost".to_string(),
            port: 1883,
            use_websocket: false,
            alpn: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_packets_flow_both_ways() {
        let (bootstrap, mut broker) = MockBootstrap::new();
        let mut stream = bootstrap.connect(&endpoint(), None).await.unwrap();
        let mut session = broker.accept().await.unwrap();

        stream.writer.write_packet(Packet::PingReq).await.unwrap();
        assert_eq!(session.recv().await, Some(Packet::PingReq));

        assert!(session.send(Packet::PingResp));
        assert_eq!(stream.reader.read_packet().await.unwrap(), Packet::PingResp);
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.last_endpoint(), Some(endpoint()));
    }

    #[tokio::test]
    async fn test_drop_connection_fails_both_halves() {
        let (bootstrap, mut broker) = MockBootstrap::new();
        let mut stream = bootstrap.connect(&endpoint(), None).await.unwrap();
        let session = broker.accept().await.unwrap();

        session.drop_connection();
        assert!(stream.reader.read_packet().await.is_err());
        assert!(stream.writer.write_packet(Packet::PingReq).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_connect() {
        let (bootstrap, broker) = MockBootstrap::new();
        broker.set_behavior(MockBehavior {
            fail_connect: true,
            ..Default::default()
        });
        assert!(bootstrap.connect(&endpoint(), None).await.is_err());
        assert_eq!(broker.connect_attempts(), 1);
    }
}
