//! Client factory and managed connections
//!
//! A [`Client`] holds the transport bootstrap and TLS context shared by all
//! of its connections. It carries no protocol logic of its own.

mod connection;
mod retry;
mod state;

pub use self::connection::{Connection, ConnectionCallbacks};
pub use self::retry::ReconnectPolicy;

pub(crate) use self::connection::Shared;

use crate::error::Result;
use crate::transport::{Bootstrap, TlsOptions};
use crate::types::SessionConfig;
use std::sync::Arc;

use self::state::Core;

/// Factory for [`Connection`]s sharing one transport configuration
///
/// Cloning is cheap; clones share the same bootstrap and TLS context.
///
/// ```rust,no_run
/// # use mqtt_session::{Client, ConnectionCallbacks, SessionConfig};
/// # use mqtt_session::transport::mock::MockBootstrap;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let (bootstrap, _broker) = MockBootstrap::new();
/// let client = Client::new(bootstrap);
/// let connection = client.new_connection(
///     SessionConfig::new("sensor-7", "broker.local", 1883).with_keep_alive(30),
///     ConnectionCallbacks::new()
///         .on_connection_interrupted(|err| eprintln!("interrupted: {err}"))
///         .on_connection_resumed(|ack| println!("resumed, session present: {}", ack.session_present)),
/// )?;
/// let connack = connection.connect()?.await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    bootstrap: Arc<dyn Bootstrap>,
    tls: Option<Arc<TlsOptions>>,
}

impl Client {
    pub fn new(bootstrap: impl Bootstrap + 'static) -> Self {
        Self {
            bootstrap: Arc::new(bootstrap),
            tls: None,
        }
    }

    /// Secures every connection made by this client with `tls`
    #[must_use]
    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(Arc::new(tls));
        self
    }

    #[must_use]
    pub fn tls(&self) -> Option<&TlsOptions> {
        self.tls.as_deref()
    }

    /// Creates a `Disconnected` connection for `config`
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidConfig` if `config` fails validation
    pub fn new_connection(
        &self,
        config: SessionConfig,
        callbacks: ConnectionCallbacks,
    ) -> Result<Connection> {
        config.validate()?;
        let policy = ReconnectPolicy::from_config(&config)?;
        tracing::debug!(client_id = %config.client_id, host = %config.host_name, port = config.port, "Creating connection");
        Ok(Connection::new(
            config,
            callbacks,
            Arc::clone(&self.bootstrap),
            self.tls.clone(),
            Core::new(policy),
        ))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}
