use crate::types::{ConnectReturnCode, ConnectionState};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Why a tracked operation failed without a matching acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationFailure {
    /// The connection was closed by `disconnect()` while the operation was pending
    ConnectionClosed,
    /// The transport dropped while the operation was pending
    ConnectionInterrupted,
    /// No acknowledgement arrived within the configured window
    Timeout,
    /// The packet could not be handed to the transport
    Transport(String),
}

impl std::fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::ConnectionInterrupted => f.write_str("connection interrupted"),
            Self::Timeout => f.write_str("timed out"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

/// Errors produced by a managed MQTT session
///
/// `InvalidState`, `InvalidConfig`, `InvalidTopicName`, `InvalidTopicFilter`
/// and `IdExhausted` are returned synchronously by the operation call. All
/// other variants arrive through an [`OperationHandle`](crate::OperationHandle).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Connection rejected by broker: {0:?}")]
    ConnectionRejected(ConnectReturnCode),

    #[error("Subscription rejected by broker (packet id {packet_id})")]
    SubscriptionRejected { packet_id: u16 },

    #[error("Operation failed (packet id {packet_id:?}): {reason}")]
    Operation {
        packet_id: Option<u16>,
        reason: OperationFailure,
    },

    #[error("Timeout")]
    Timeout,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation {operation} not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Packet identifiers exhausted")]
    IdExhausted,

    #[error("Packet identifier already in use: {0}")]
    PacketIdInUse(u16),

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl SessionError {
    pub(crate) fn operation(packet_id: Option<u16>, reason: OperationFailure) -> Self {
        Self::Operation { packet_id, reason }
    }

    /// Whether this error means the connection was shut down underneath the caller
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            Self::Operation {
                reason: OperationFailure::ConnectionClosed,
                ..
            }
        )
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}
