//! # Managed MQTT 3.1.1 client session
//!
//! A [`Connection`] is a long-lived logical session with a broker. It survives
//! transport interruptions, correlates subscribe, unsubscribe, publish and
//! ping requests with the broker's acknowledgements, and enforces QoS and
//! last-will semantics.
//!
//! Socket, TLS and websocket I/O and the byte-level wire codec are external
//! collaborators reached through the [`transport::Bootstrap`] trait.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mqtt_session::transport::mock::MockBootstrap;
//! use mqtt_session::{Client, ConnectionCallbacks, QoS, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (bootstrap, _broker) = MockBootstrap::new();
//!     let client = Client::new(bootstrap);
//!     let connection = client.new_connection(
//!         SessionConfig::new("test-client", "localhost", 1883),
//!         ConnectionCallbacks::new(),
//!     )?;
//!
//!     let connack = connection.connect()?.await?;
//!     println!("session present: {}", connack.session_present);
//!
//!     let (suback, _id) = connection.subscribe("sensors/+/data", QoS::AtLeastOnce, |msg| {
//!         println!("{}: {:?}", msg.topic, msg.payload);
//!     })?;
//!     suback.await?;
//!
//!     let (puback, _id) =
//!         connection.publish("sensors/temp/data", &b"25.5"[..], QoS::AtLeastOnce, false)?;
//!     puback.await?;
//!
//!     connection.disconnect(true).await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]

pub mod client;
pub mod error;
pub mod handle;
pub mod packet;
pub mod packet_id;
pub mod session;
pub(crate) mod tasks;
pub mod topic_matching;
pub mod transport;
pub mod types;

pub use client::{Client, Connection, ConnectionCallbacks, ReconnectPolicy};
pub use error::{OperationFailure, Result, SessionError};
pub use handle::OperationHandle;
pub use packet::{Packet, SubAckReturnCode};
pub use session::{OperationKind, OperationTracker, PendingSummary, PublishCallback};
pub use types::{
    ConnAck, ConnectReturnCode, ConnectionState, Message, PubAck, SessionConfig, SubAck,
    UnsubAck, Will,
};

/// MQTT delivery guarantee
///
/// Ordered so a granted level can be compared with the requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl From<u8> for QoS {
    fn from(value: u8) -> Self {
        match value {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce, // Default to QoS 0 for invalid values
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::from(0), QoS::AtMostOnce);
        assert_eq!(QoS::from(1), QoS::AtLeastOnce);
        assert_eq!(QoS::from(2), QoS::ExactlyOnce);

        // Invalid values default to AtMostOnce
        assert_eq!(QoS::from(3), QoS::AtMostOnce);
        assert_eq!(QoS::from(255), QoS::AtMostOnce);
    }

    #[test]
    fn test_qos_ordering() {
        assert!(QoS::AtMostOnce < QoS::AtLeastOnce);
        assert!(QoS::AtLeastOnce < QoS::ExactlyOnce);
        assert_eq!(u8::from(QoS::ExactlyOnce), 2);
    }
}
