use crate::error::{Result, SessionError};
use crate::topic_matching;
use crate::QoS;
use bytes::Bytes;
use std::time::Duration;

/// Lifecycle state of a [`Connection`](crate::Connection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Interrupted,
    Reconnecting,
    ShuttingDown,
    Terminated,
}

impl ConnectionState {
    /// Whether `next` is a legal successor of this state
    #[must_use]
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::{
            Connected, Connecting, Disconnected, Interrupted, Reconnecting, ShuttingDown,
            Terminated,
        };
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected | Disconnected)
                | (Connected, Interrupted)
                | (Interrupted, Reconnecting)
                | (Reconnecting, Connected | Interrupted)
                | (
                    Disconnected | Connecting | Connected | Interrupted | Reconnecting,
                    ShuttingDown
                )
                | (ShuttingDown, Terminated | Disconnected)
        )
    }

    /// Whether no further transitions are possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Terminated
    }
}

/// CONNACK return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    /// Rejections worth retrying without application involvement
    #[must_use]
    pub fn is_transient(self) -> bool {
        self == ConnectReturnCode::ServerUnavailable
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::UnacceptableProtocolVersion),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::BadUsernameOrPassword),
            5 => Ok(Self::NotAuthorized),
            other => Err(SessionError::Transport(format!(
                "unknown CONNACK return code {other}"
            ))),
        }
    }
}

/// Last-will message the broker publishes if the session ends unexpectedly
///
/// # Examples
///
/// ```
/// use mqtt_session::{QoS, Will};
///
/// let will = Will::new("devices/42/status", "offline")
///     .with_qos(QoS::AtLeastOnce)
///     .with_retain(true);
/// assert_eq!(will.topic, "devices/42/status");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
    pub retain: bool,
}

impl Will {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            qos: QoS::AtMostOnce,
            payload: payload.into(),
            retain: false,
        }
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Connection parameters for a [`Connection`](crate::Connection)
///
/// The configuration is frozen once the connection is constructed; every
/// reconnect re-sends exactly these parameters.
///
/// # Examples
///
/// ```
/// use mqtt_session::{SessionConfig, Will};
/// use std::time::Duration;
///
/// let config = SessionConfig::new("sensor-7", "broker.local", 8883)
///     .with_clean_session(false)
///     .with_keep_alive(30)
///     .with_credentials("device", "secret")
///     .with_will(Will::new("sensors/7/status", "gone"))
///     .with_reconnect_backoff(Duration::from_secs(1), Duration::from_secs(30));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub client_id: String,
    pub host_name: String,
    pub port: u16,
    pub use_websocket: bool,
    pub alpn: Option<Vec<String>>,
    pub clean_session: bool,
    /// Keep-alive interval in seconds, 0 disables keep-alive
    pub keep_alive: u16,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub reconnect_min_timeout: Duration,
    pub reconnect_max_timeout: Duration,
    /// Automatic reconnect attempts before giving up (None = unlimited)
    pub reconnect_max_attempts: Option<u32>,
    /// Reconnect automatically after a transport drop
    pub auto_reconnect: bool,
    /// Ack deadline for subscribe/unsubscribe/publish (None = wait indefinitely)
    pub operation_timeout: Option<Duration>,
}

impl SessionConfig {
    #[must_use]
    pub fn new(client_id: impl Into<String>, host_name: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host_name: host_name.into(),
            port,
            use_websocket: false,
            alpn: None,
            clean_session: true,
            keep_alive: 0,
            will: None,
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(5),
            reconnect_min_timeout: Duration::from_secs(5),
            reconnect_max_timeout: Duration::from_secs(60),
            reconnect_max_attempts: None,
            auto_reconnect: true,
            operation_timeout: None,
        }
    }

    #[must_use]
    pub fn with_websocket(mut self, use_websocket: bool) -> Self {
        self.use_websocket = use_websocket;
        self
    }

    #[must_use]
    pub fn with_alpn<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alpn = Some(protocols.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    #[must_use]
    pub fn with_will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_min_timeout = min;
        self.reconnect_max_timeout = max;
        self
    }

    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_max_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Keep-alive as a duration, `None` when disabled
    #[must_use]
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive > 0).then(|| Duration::from_secs(u64::from(self.keep_alive)))
    }

    /// Checks the construction invariants
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidConfig` describing the first violated rule
    pub fn validate(&self) -> Result<()> {
        if self.reconnect_min_timeout > self.reconnect_max_timeout {
            return Err(SessionError::InvalidConfig(format!(
                "reconnect min backoff {:?} exceeds max backoff {:?}",
                self.reconnect_min_timeout, self.reconnect_max_timeout
            )));
        }
        if self.reconnect_min_timeout.is_zero() {
            return Err(SessionError::InvalidConfig(
                "reconnect min backoff must be non-zero".to_string(),
            ));
        }
        if self.client_id.is_empty() && !self.clean_session {
            return Err(SessionError::InvalidConfig(
                "empty client id requires clean_session".to_string(),
            ));
        }
        if self.host_name.is_empty() {
            return Err(SessionError::InvalidConfig("empty host name".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(SessionError::InvalidConfig(
                "connect timeout must be non-zero".to_string(),
            ));
        }
        if let Some(will) = &self.will {
            if will.topic.is_empty() || !topic_matching::is_valid_topic(&will.topic) {
                return Err(SessionError::InvalidConfig(format!(
                    "invalid will topic {:?}",
                    will.topic
                )));
            }
        }
        Ok(())
    }
}

/// Result of an accepted CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
}

/// Result of an acknowledged SUBSCRIBE
///
/// `qos` is the level granted by the broker, which may be lower than requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub topic: String,
    pub qos: QoS,
}

/// Result of an acknowledged UNSUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
    pub topic: String,
}

/// Result of a completed PUBLISH
///
/// QoS 0 publishes carry no packet identifier and complete once the packet
/// has been handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub packet_id: Option<u16>,
    pub qos: QoS,
}

/// An application message delivered to a subscription callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}
