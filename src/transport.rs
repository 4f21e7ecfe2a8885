//! Transport boundary
//!
//! Socket, TLS and websocket I/O as well as MQTT byte framing live outside
//! this crate. A [`Bootstrap`] opens a byte stream to an [`Endpoint`] and
//! hands back a codec-wrapped [`PacketStream`] of decoded packets.

pub mod mock;

use crate::error::Result;
use crate::packet::Packet;
use crate::types::SessionConfig;
use async_trait::async_trait;
use std::path::PathBuf;

/// Where and how to reach the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub use_websocket: bool,
    pub alpn: Vec<String>,
}

impl From<&SessionConfig> for Endpoint {
    fn from(config: &SessionConfig) -> Self {
        Self {
            host: config.host_name.clone(),
            port: config.port,
            use_websocket: config.use_websocket,
            alpn: config.alpn.clone().unwrap_or_default(),
        }
    }
}

/// Client-level TLS context, shared read-only by every connection
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// SNI / verification name, defaults to the endpoint host
    pub server_name: Option<String>,
    pub verify_peer: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            ca_file: None,
            cert_file: None,
            key_file: None,
            server_name: None,
            verify_peer: true,
        }
    }
}

impl TlsOptions {
    #[must_use]
    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_client_cert(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert.into());
        self.key_file = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Receiving half of an established packet stream
#[async_trait]
pub trait PacketReader: Send {
    /// Reads the next decoded packet
    ///
    /// # Errors
    ///
    /// Returns an error when the stream is closed or cannot be decoded
    async fn read_packet(&mut self) -> Result<Packet>;
}

/// Sending half of an established packet stream
#[async_trait]
pub trait PacketWriter: Send {
    /// Encodes and writes one packet
    ///
    /// # Errors
    ///
    /// Returns an error if the packet could not be handed to the stream
    async fn write_packet(&mut self, packet: Packet) -> Result<()>;

    /// Closes the stream
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be closed cleanly
    async fn close(&mut self) -> Result<()>;
}

/// An established connection to the broker, split for concurrent use
pub struct PacketStream {
    pub reader: Box<dyn PacketReader>,
    pub writer: Box<dyn PacketWriter>,
}

/// Opens transport connections (TCP, TLS, websocket) to a broker
#[async_trait]
pub trait Bootstrap: Send + Sync {
    /// Establishes a stream to `endpoint`, secured with `tls` when given
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established
    async fn connect(&self, endpoint: &Endpoint, tls: Option<&TlsOptions>)
        -> Result<PacketStream>;
}
