//! Managed MQTT connection
//!
//! All protocol state lives in a [`Core`] behind one mutex. Public
//! operations and background tasks take the lock, mutate state, queue
//! packets and release it again; nothing awaits while holding it and no
//! application callback runs under it.

use crate::client::state::{AttemptKind, Core};
use crate::error::{OperationFailure, Result, SessionError};
use crate::handle::{pair, Completer, OperationHandle};
use crate::packet::{
    ConnAckPacket, ConnectPacket, Packet, PublishPacket, SubAckPacket, SubAckReturnCode,
    SubscribePacket, UnsubscribePacket,
};
use crate::session::subscription::PublishCallback;
use crate::session::tracker::{Ack, Completion, OperationKind, PendingSummary, Resolved};
use crate::tasks::{self, Outbound};
use crate::topic_matching;
use crate::transport::{Bootstrap, Endpoint, PacketStream, TlsOptions};
use crate::types::{
    ConnAck, ConnectReturnCode, ConnectionState, Message, PubAck, SessionConfig, SubAck,
    UnsubAck,
};
use crate::QoS;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Consecutive unanswered keep-alive pings tolerated before the link is declared dead
const MAX_MISSED_PINGS: u32 = 2;

type InterruptedCallback = Arc<dyn Fn(SessionError) + Send + Sync>;
type ResumedCallback = Arc<dyn Fn(ConnAck) + Send + Sync>;

/// Lifecycle callbacks supplied by the application
///
/// Both run on a background task, never while the connection lock is held,
/// so they may call back into the [`Connection`].
#[derive(Clone, Default)]
pub struct ConnectionCallbacks {
    on_interrupted: Option<InterruptedCallback>,
    on_resumed: Option<ResumedCallback>,
}

impl ConnectionCallbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked once per `Connected -> Interrupted` transition
    #[must_use]
    pub fn on_connection_interrupted<F>(mut self, callback: F) -> Self
    where
        F: Fn(SessionError) + Send + Sync + 'static,
    {
        self.on_interrupted = Some(Arc::new(callback));
        self
    }

    /// Invoked after every successful reconnection
    #[must_use]
    pub fn on_connection_resumed<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConnAck) + Send + Sync + 'static,
    {
        self.on_resumed = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for ConnectionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCallbacks")
            .field("on_interrupted", &self.on_interrupted.is_some())
            .field("on_resumed", &self.on_resumed.is_some())
            .finish()
    }
}

/// State shared between a [`Connection`] and its background tasks
pub(crate) struct Shared {
    config: Arc<SessionConfig>,
    endpoint: Endpoint,
    bootstrap: Arc<dyn Bootstrap>,
    tls: Option<Arc<TlsOptions>>,
    callbacks: ConnectionCallbacks,
    core: Mutex<Core>,
}

/// A long-lived logical session with one broker
///
/// Created by [`Client::new_connection`](crate::Client::new_connection).
/// Every operation validates the current state synchronously and returns an
/// [`OperationHandle`] for the broker's answer. Operations must be called
/// from within a Tokio runtime.
///
/// Dropping the `Connection` stops its background tasks without sending
/// DISCONNECT; call [`disconnect`](Self::disconnect) for an orderly close.
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.shared.config.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        config: SessionConfig,
        callbacks: ConnectionCallbacks,
        bootstrap: Arc<dyn Bootstrap>,
        tls: Option<Arc<TlsOptions>>,
        core: Core,
    ) -> Self {
        let endpoint = Endpoint::from(&config);
        Self {
            shared: Arc::new(Shared {
                config: Arc::new(config),
                endpoint,
                bootstrap,
                tls,
                callbacks,
                core: Mutex::new(core),
            }),
        }
    }

    /// Opens the transport and performs the CONNECT handshake
    ///
    /// The handle resolves with the broker's [`ConnAck`], or fails with
    /// `ConnectionRejected` or `Timeout`; either failure returns the
    /// connection to `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the connection is `Disconnected`
    pub fn connect(&self) -> Result<OperationHandle<ConnAck>> {
        let shared = &self.shared;
        let mut core = shared.lock();
        core.require(ConnectionState::Disconnected, "connect")?;

        let (done, handle) = pair();
        core.connect_attempted = true;
        core.transition(ConnectionState::Connecting);
        shared.begin_attempt(&mut core, AttemptKind::Connect, Duration::ZERO, done);
        tracing::info!(client_id = %shared.config.client_id, host = %shared.endpoint.host, port = shared.endpoint.port, "Connecting");
        Ok(handle)
    }

    /// Re-runs the connect sequence with the original parameters
    ///
    /// Valid from `Interrupted`, `Reconnecting` and from `Disconnected` once
    /// `connect()` has been called. With `respect_backoff` the attempt waits
    /// out the current backoff delay (joining an attempt already scheduled);
    /// without it the attempt starts immediately. The handle resolves with
    /// the outcome of that attempt.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` from any other state
    pub fn reconnect(&self, respect_backoff: bool) -> Result<OperationHandle<ConnAck>> {
        let shared = &self.shared;
        let mut core = shared.lock();
        let (done, handle) = pair();
        let delay = if respect_backoff {
            core.policy.jittered_delay(core.reconnect_attempt)
        } else {
            Duration::ZERO
        };

        let state = core.state;
        match state {
            ConnectionState::Interrupted => {
                core.transition(ConnectionState::Reconnecting);
                shared.begin_attempt(&mut core, AttemptKind::Reconnect, delay, done);
            }
            ConnectionState::Reconnecting if respect_backoff => {
                if let Err(done) = core.tracker.join_connect(done) {
                    shared.begin_attempt(&mut core, AttemptKind::Reconnect, delay, done);
                }
            }
            ConnectionState::Reconnecting => {
                shared.begin_attempt(&mut core, AttemptKind::Reconnect, Duration::ZERO, done);
            }
            ConnectionState::Disconnected if core.connect_attempted => {
                core.transition(ConnectionState::Connecting);
                shared.begin_attempt(&mut core, AttemptKind::Reconnect, delay, done);
            }
            _ => return Err(core.invalid("reconnect")),
        }
        tracing::info!(respect_backoff, ?delay, "Reconnect requested");
        Ok(handle)
    }

    /// Closes the session
    ///
    /// Every pending operation fails with a connection-closed error before
    /// the returned handle resolves. DISCONNECT is sent when the transport
    /// is live. With `is_final` the connection ends `Terminated` and refuses
    /// all further calls; otherwise it returns to `Disconnected` and may be
    /// connected again. Calling this on a `Terminated` connection returns an
    /// already resolved handle.
    pub fn disconnect(&self, is_final: bool) -> OperationHandle<()> {
        self.shared.disconnect(is_final)
    }

    /// Subscribes to `topic` and routes matching messages to `callback`
    ///
    /// Returns the completion handle with the packet identifier used. The
    /// handle resolves with the granted QoS, which may be lower than `qos`.
    /// Subscribing again to the same filter replaces its callback.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless `Connected`, `InvalidTopicFilter` for a
    /// malformed filter and `IdExhausted` if no packet identifier is free
    pub fn subscribe<F>(
        &self,
        topic: &str,
        qos: QoS,
        callback: F,
    ) -> Result<(OperationHandle<SubAck>, u16)>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let shared = &self.shared;
        let mut core = shared.lock();
        core.require(ConnectionState::Connected, "subscribe")?;
        topic_matching::validate_filter(topic)?;

        let packet_id = core.tracker.allocate_id()?;
        let (done, handle) = pair();
        let callback: PublishCallback = Arc::new(callback);
        let seq = core.tracker.register(
            packet_id,
            Completion::Subscribe {
                topic: topic.to_string(),
                requested: qos,
                callback,
                done,
            },
        )?;
        core.send(
            Packet::Subscribe(SubscribePacket {
                packet_id,
                filters: vec![(topic.to_string(), qos)],
            }),
            None,
        );
        shared.arm_operation_timeout(seq);
        tracing::debug!(packet_id, topic, ?qos, "SUBSCRIBE sent");
        Ok((handle, packet_id))
    }

    /// Unsubscribes from `topic`
    ///
    /// Routing for the filter is removed only once UNSUBACK arrives, so
    /// messages delivered in the meantime still reach the callback.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless `Connected`, `InvalidTopicFilter` for a
    /// malformed filter and `IdExhausted` if no packet identifier is free
    pub fn unsubscribe(&self, topic: &str) -> Result<(OperationHandle<UnsubAck>, u16)> {
        let shared = &self.shared;
        let mut core = shared.lock();
        core.require(ConnectionState::Connected, "unsubscribe")?;
        topic_matching::validate_filter(topic)?;

        let packet_id = core.tracker.allocate_id()?;
        let (done, handle) = pair();
        let seq = core.tracker.register(
            packet_id,
            Completion::Unsubscribe {
                topic: topic.to_string(),
                done,
            },
        )?;
        core.send(
            Packet::Unsubscribe(UnsubscribePacket {
                packet_id,
                filters: vec![topic.to_string()],
            }),
            None,
        );
        shared.arm_operation_timeout(seq);
        tracing::debug!(packet_id, topic, "UNSUBSCRIBE sent");
        Ok((handle, packet_id))
    }

    /// Publishes a message
    ///
    /// QoS 0 consumes no packet identifier and resolves once the packet is
    /// handed to the transport. QoS 1 resolves on PUBACK, QoS 2 on PUBCOMP.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless `Connected`, `InvalidTopicName` for an
    /// empty or wildcard topic and `IdExhausted` if no packet identifier is free
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(OperationHandle<PubAck>, Option<u16>)> {
        let shared = &self.shared;
        let mut core = shared.lock();
        core.require(ConnectionState::Connected, "publish")?;
        topic_matching::validate_topic(topic)?;

        let payload = payload.into();
        let (done, handle) = pair();

        if qos == QoS::AtMostOnce {
            core.send(
                Packet::Publish(PublishPacket {
                    topic_name: topic.to_string(),
                    packet_id: None,
                    payload,
                    qos,
                    retain,
                    dup: false,
                }),
                Some(done),
            );
            tracing::trace!(topic, "QoS 0 PUBLISH queued");
            return Ok((handle, None));
        }

        let packet_id = core.tracker.allocate_id()?;
        let seq = core.tracker.register(
            packet_id,
            Completion::Publish {
                qos,
                released: false,
                done,
            },
        )?;
        core.send(
            Packet::Publish(PublishPacket {
                topic_name: topic.to_string(),
                packet_id: Some(packet_id),
                payload,
                qos,
                retain,
                dup: false,
            }),
            None,
        );
        shared.arm_operation_timeout(seq);
        tracing::debug!(packet_id, topic, ?qos, "PUBLISH sent");
        Ok((handle, Some(packet_id)))
    }

    /// Sends PINGREQ and resolves on PINGRESP
    ///
    /// A missing PINGRESP within the connect timeout interrupts the
    /// connection. Concurrent calls share one outstanding PINGREQ.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless `Connected`
    pub fn ping(&self) -> Result<OperationHandle<()>> {
        let shared = &self.shared;
        let mut core = shared.lock();
        core.require(ConnectionState::Connected, "ping")?;
        let (done, handle) = pair();
        shared.start_ping(&mut core, Some(done), true);
        Ok(handle)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Number of subscribe, unsubscribe and QoS 1/2 publish operations awaiting acknowledgement
    #[must_use]
    pub fn outstanding_operations(&self) -> usize {
        self.shared.lock().tracker.outstanding()
    }

    /// Every request still awaiting the broker, oldest first
    ///
    /// Includes the CONNECT and PINGREQ in flight and, while shutting
    /// down, the DISCONNECT.
    #[must_use]
    pub fn pending_operations(&self) -> Vec<PendingSummary> {
        let core = self.shared.lock();
        let mut pending = core.tracker.snapshot();
        if let Some(created_at) = core.shutdown_started {
            pending.push(PendingSummary {
                packet_id: None,
                kind: OperationKind::Disconnect,
                created_at,
            });
        }
        pending
    }

    /// Failed reconnect attempts since the last accepted CONNACK
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().reconnect_attempt
    }

    /// Confirmed subscriptions with their granted QoS, in subscription order
    #[must_use]
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.shared.lock().router.filters()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect_packet(&self) -> ConnectPacket {
        let config = &self.config;
        ConnectPacket {
            client_id: config.client_id.clone(),
            clean_session: config.clean_session,
            keep_alive: config.keep_alive,
            will: config.will.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    /// Starts a new transport session; the caller has already moved to
    /// `Connecting` or `Reconnecting`
    fn begin_attempt(
        self: &Arc<Self>,
        core: &mut Core,
        kind: AttemptKind,
        delay: Duration,
        waiter: Completer<ConnAck>,
    ) {
        self.begin_attempt_inner(core, kind, delay);
        if let Err(waiter) = core.tracker.join_connect(waiter) {
            waiter.complete(Err(core.invalid("connect")));
        }
    }

    fn begin_attempt_inner(self: &Arc<Self>, core: &mut Core, kind: AttemptKind, delay: Duration) {
        core.teardown_transport();
        core.generation += 1;
        core.attempt = Some(kind);
        core.tracker.begin_connect();
        core.tasks.attempt = Some(tokio::spawn(tasks::connect_attempt_task(
            Arc::downgrade(self),
            core.generation,
            delay,
        )));
        tracing::debug!(generation = core.generation, ?kind, ?delay, "Connect attempt scheduled");
    }

    /// Opens the transport for attempt `generation`
    ///
    /// Transport setup and the CONNACK wait share one `connect_timeout`
    /// deadline, taken when the attempt starts.
    pub(crate) async fn run_attempt(self: &Arc<Self>, generation: u64) {
        let deadline = Instant::now() + self.config.connect_timeout;
        let opened = tokio::time::timeout_at(
            deadline,
            self.bootstrap.connect(&self.endpoint, self.tls.as_deref()),
        )
        .await;

        match opened {
            Ok(Ok(stream)) => self.attach_transport(generation, stream, deadline),
            Ok(Err(e)) => {
                tracing::error!(error = %e, host = %self.endpoint.host, "Transport setup failed");
                self.fail_attempt(generation, e);
            }
            Err(_) => {
                tracing::warn!("Transport setup timed out");
                self.fail_attempt(generation, SessionError::Timeout);
            }
        }
    }

    fn attach_transport(self: &Arc<Self>, generation: u64, stream: PacketStream, deadline: Instant) {
        let mut core = self.lock();
        let attempting = matches!(
            core.state,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        );
        if core.generation != generation || !attempting {
            drop(core);
            tracing::debug!(generation, "Discarding transport of abandoned attempt");
            let PacketStream { mut writer, .. } = stream;
            tokio::spawn(async move {
                let _ = writer.close().await;
            });
            return;
        }

        let weak = Arc::downgrade(self);
        let (tx, rx) = mpsc::unbounded_channel();
        core.outbound = Some(tx);
        tokio::spawn(tasks::packet_writer_task(
            weak.clone(),
            generation,
            stream.writer,
            rx,
        ));
        core.tasks.reader = Some(tokio::spawn(tasks::packet_reader_task(
            weak.clone(),
            generation,
            stream.reader,
        )));

        core.send(Packet::Connect(Box::new(self.connect_packet())), None);
        core.tasks.connect_timer = Some(tokio::spawn(tasks::connect_timer_task(
            weak,
            generation,
            deadline,
        )));
        tracing::debug!(generation, remaining = ?deadline.saturating_duration_since(Instant::now()), "Transport established, CONNECT sent");
    }

    /// Fails the current connect attempt if it is still `generation`
    pub(crate) fn fail_attempt(self: &Arc<Self>, generation: u64, error: SessionError) {
        let core = self.lock();
        let attempting = matches!(
            core.state,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        );
        if core.generation != generation || !attempting {
            return;
        }
        self.fail_attempt_locked(core, error);
    }

    fn fail_attempt_locked(self: &Arc<Self>, mut core: MutexGuard<'_, Core>, error: SessionError) {
        core.teardown_transport();
        core.attempt = None;
        if let Some(seq) = core.tracker.connect_seq() {
            core.tracker.complete_connect(seq, &Err(error.clone()));
        }

        let state = core.state;
        match state {
            ConnectionState::Connecting => {
                tracing::warn!(error = %error, "Connect attempt failed");
                core.transition(ConnectionState::Disconnected);
            }
            ConnectionState::Reconnecting => {
                core.transition(ConnectionState::Interrupted);
                core.reconnect_attempt = core.reconnect_attempt.saturating_add(1);
                tracing::warn!(error = %error, attempt = core.reconnect_attempt, "Reconnect attempt failed");
                match error {
                    SessionError::ConnectionRejected(code) if !code.is_transient() => {
                        tracing::warn!(?code, "Broker rejected reconnect, waiting for application");
                    }
                    _ => self.schedule_reconnect(&mut core),
                }
            }
            _ => {}
        }
    }

    /// Moves `Interrupted -> Reconnecting` with a backoff delay, if allowed
    fn schedule_reconnect(self: &Arc<Self>, core: &mut Core) {
        if !self.config.auto_reconnect {
            tracing::info!("Automatic reconnect disabled");
            return;
        }
        if let Some(max) = self.config.reconnect_max_attempts {
            if core.reconnect_attempt >= max {
                tracing::warn!(attempts = core.reconnect_attempt, "Reconnect attempts exhausted");
                return;
            }
        }
        let delay = core.policy.jittered_delay(core.reconnect_attempt);
        core.transition(ConnectionState::Reconnecting);
        self.begin_attempt_inner(core, AttemptKind::Reconnect, delay);
    }

    fn on_connack(self: &Arc<Self>, mut core: MutexGuard<'_, Core>, connack: ConnAckPacket) -> bool {
        if !matches!(
            core.state,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            tracing::warn!(state = ?core.state, "Unexpected CONNACK ignored");
            return true;
        }
        if let Some(timer) = core.tasks.connect_timer.take() {
            timer.abort();
        }

        if connack.return_code != ConnectReturnCode::Accepted {
            tracing::warn!(code = ?connack.return_code, "CONNACK rejected");
            self.fail_attempt_locked(core, SessionError::ConnectionRejected(connack.return_code));
            return false;
        }

        let ack = ConnAck {
            session_present: connack.session_present,
        };
        let resumed = core.attempt.take() == Some(AttemptKind::Reconnect);
        core.transition(ConnectionState::Connected);
        core.reconnect_attempt = 0;
        core.missed_pings = 0;
        core.ping_explicit = false;
        if !ack.session_present {
            core.inbound_qos2.clear();
        }
        if let Some(seq) = core.tracker.connect_seq() {
            core.tracker.complete_connect(seq, &Ok(ack));
        }
        if let Some(period) = self.config.keep_alive_interval() {
            core.tasks.keepalive = Some(tokio::spawn(tasks::keepalive_task(
                Arc::downgrade(self),
                core.generation,
                period,
            )));
        }
        tracing::info!(session_present = ack.session_present, resumed, "Connected");
        drop(core);

        if resumed {
            if let Some(callback) = &self.callbacks.on_resumed {
                callback(ack);
            }
        }
        true
    }

    /// Reports a broken transport for session `generation`
    pub(crate) fn transport_failed(self: &Arc<Self>, generation: u64, error: SessionError) {
        let core = self.lock();
        if core.generation != generation {
            return;
        }
        let state = core.state;
        match state {
            ConnectionState::Connected => self.interrupt(core, error),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.fail_attempt_locked(core, error);
            }
            ConnectionState::ShuttingDown => self.finish_shutdown(core),
            _ => {}
        }
    }

    fn interrupt(self: &Arc<Self>, mut core: MutexGuard<'_, Core>, error: SessionError) {
        tracing::warn!(error = %error, "Connection interrupted");
        core.transition(ConnectionState::Interrupted);
        core.teardown_transport();
        core.tracker.fail_all(OperationFailure::ConnectionInterrupted);
        let generation = core.generation;
        drop(core);

        if let Some(callback) = &self.callbacks.on_interrupted {
            callback(error);
        }

        let mut core = self.lock();
        if core.state == ConnectionState::Interrupted && core.generation == generation {
            self.schedule_reconnect(&mut core);
        }
    }

    fn start_ping(self: &Arc<Self>, core: &mut Core, waiter: Option<Completer<()>>, explicit: bool) {
        if let Some(seq) = core.tracker.begin_ping(waiter) {
            core.ping_explicit = explicit;
            core.send(Packet::PingReq, None);
            core.tasks.ping_timer = Some(tokio::spawn(tasks::ping_timer_task(
                Arc::downgrade(self),
                core.generation,
                seq,
                self.config.connect_timeout,
            )));
        } else if explicit {
            core.ping_explicit = true;
        }
    }

    /// Keep-alive tick; returns false once the task should stop
    pub(crate) fn keepalive_tick(self: &Arc<Self>, generation: u64, idle_since: Instant) -> bool {
        let mut core = self.lock();
        if core.generation != generation || core.state != ConnectionState::Connected {
            return false;
        }
        if !core.tracker.ping_outstanding() && core.last_send <= idle_since {
            tracing::trace!("Link idle, sending keep-alive PINGREQ");
            self.start_ping(&mut core, None, false);
        }
        true
    }

    pub(crate) fn ping_timed_out(self: &Arc<Self>, generation: u64, seq: u64) {
        let mut core = self.lock();
        if core.generation != generation || core.state != ConnectionState::Connected {
            return;
        }
        if !core.tracker.complete_ping(Some(seq), &Err(SessionError::Timeout)) {
            return;
        }
        // This timer is the running task
        core.tasks.ping_timer = None;
        core.missed_pings += 1;
        tracing::warn!(missed = core.missed_pings, "PINGRESP not received");
        if core.ping_explicit || core.missed_pings >= MAX_MISSED_PINGS {
            self.interrupt(core, SessionError::Timeout);
        }
    }

    fn arm_operation_timeout(self: &Arc<Self>, seq: u64) {
        if let Some(timeout) = self.config.operation_timeout {
            tokio::spawn(tasks::operation_timer_task(
                Arc::downgrade(self),
                seq,
                timeout,
            ));
        }
    }

    pub(crate) fn operation_timed_out(&self, seq: u64) {
        self.lock().tracker.expire(seq);
    }

    /// Dispatches one inbound packet; returns false once the reader should stop
    pub(crate) fn handle_packet(self: &Arc<Self>, generation: u64, packet: Packet) -> bool {
        let mut core = self.lock();
        if core.generation != generation {
            return false;
        }
        if core.state == ConnectionState::ShuttingDown {
            tracing::debug!(packet = packet.name(), "Ignoring packet during shutdown");
            return true;
        }

        match packet {
            Packet::ConnAck(connack) => return self.on_connack(core, connack),
            Packet::SubAck(SubAckPacket {
                packet_id,
                return_codes,
            }) => {
                let code = return_codes
                    .first()
                    .copied()
                    .unwrap_or(SubAckReturnCode::Failure);
                if let Some(Resolved::Subscribed {
                    filter,
                    qos,
                    callback,
                }) = core.tracker.resolve(packet_id, Ack::SubAck(code))
                {
                    tracing::debug!(packet_id, filter = %filter, ?qos, "Subscription confirmed");
                    core.router.insert(filter, qos, callback);
                }
            }
            Packet::UnsubAck(packet_id) => {
                if let Some(Resolved::Unsubscribed { filter }) =
                    core.tracker.resolve(packet_id, Ack::UnsubAck)
                {
                    core.router.remove(&filter);
                    tracing::debug!(packet_id, filter = %filter, "Unsubscribed");
                }
            }
            Packet::PubAck(packet_id) => {
                core.tracker.resolve(packet_id, Ack::PubAck);
            }
            Packet::PubRec(packet_id) => {
                if let Some(Resolved::Release) = core.tracker.resolve(packet_id, Ack::PubRec) {
                    core.send(Packet::PubRel(packet_id), None);
                }
            }
            Packet::PubComp(packet_id) => {
                core.tracker.resolve(packet_id, Ack::PubComp);
            }
            Packet::PubRel(packet_id) => {
                core.inbound_qos2.remove(&packet_id);
                core.send(Packet::PubComp(packet_id), None);
            }
            Packet::Publish(publish) => return self.on_publish(core, publish),
            Packet::PingResp => {
                if let Some(timer) = core.tasks.ping_timer.take() {
                    timer.abort();
                }
                core.missed_pings = 0;
                core.ping_explicit = false;
                if !core.tracker.complete_ping(None, &Ok(())) {
                    tracing::warn!("Unsolicited PINGRESP");
                }
            }
            Packet::Disconnect => {
                let error = SessionError::Transport("broker sent DISCONNECT".to_string());
                let state = core.state;
                match state {
                    ConnectionState::Connected => self.interrupt(core, error),
                    _ => self.fail_attempt_locked(core, error),
                }
                return false;
            }
            other @ (Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq) => {
                tracing::warn!(packet = other.name(), "Ignoring client-only packet from broker");
            }
        }
        true
    }

    fn on_publish(self: &Arc<Self>, mut core: MutexGuard<'_, Core>, publish: PublishPacket) -> bool {
        if core.state != ConnectionState::Connected {
            tracing::warn!(state = ?core.state, topic = %publish.topic_name, "PUBLISH before CONNACK ignored");
            return true;
        }

        let deliver = match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => true,
            (QoS::AtLeastOnce, Some(packet_id)) => {
                core.send(Packet::PubAck(packet_id), None);
                true
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                let first = core.inbound_qos2.insert(packet_id);
                core.send(Packet::PubRec(packet_id), None);
                if !first {
                    tracing::debug!(packet_id, "Duplicate QoS 2 PUBLISH not redelivered");
                }
                first
            }
            (qos, None) => {
                tracing::warn!(?qos, topic = %publish.topic_name, "PUBLISH without packet id ignored");
                false
            }
        };
        if !deliver {
            return true;
        }

        let callbacks = core.router.matching(&publish.topic_name);
        drop(core);

        if callbacks.is_empty() {
            tracing::debug!(topic = %publish.topic_name, "No subscription matches PUBLISH");
            return true;
        }
        let message = Message {
            topic: publish.topic_name,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
        };
        for callback in callbacks {
            callback(message.clone());
        }
        true
    }

    fn disconnect(self: &Arc<Self>, is_final: bool) -> OperationHandle<()> {
        let mut core = self.lock();
        if core.state.is_terminal() {
            return OperationHandle::ready(Ok(()));
        }
        if core.state == ConnectionState::ShuttingDown {
            let (done, handle) = pair();
            core.shutdown_waiters.push(done);
            core.shutdown_final |= is_final;
            return handle;
        }

        let was_connected = core.state == ConnectionState::Connected;
        let (done, handle) = pair();
        core.transition(ConnectionState::ShuttingDown);
        core.shutdown_final = is_final;
        core.shutdown_started = Some(std::time::Instant::now());
        core.shutdown_waiters.push(done);
        core.attempt = None;
        core.tasks.abort_all();

        let failed = core.tracker.fail_all(OperationFailure::ConnectionClosed);
        tracing::info!(failed, is_final, "Disconnecting");

        if was_connected {
            core.send(Packet::Disconnect, None);
        }
        let closing = core
            .outbound
            .take()
            .is_some_and(|outbound| outbound.send(Outbound::Close).is_ok());

        if closing {
            core.tasks.connect_timer = Some(tokio::spawn(tasks::shutdown_timer_task(
                Arc::downgrade(self),
                core.generation,
                self.config.connect_timeout,
            )));
        } else {
            self.finish_shutdown(core);
        }
        handle
    }

    /// Writer finished closing the transport of session `generation`
    pub(crate) fn transport_closed(self: &Arc<Self>, generation: u64) {
        let core = self.lock();
        if core.generation == generation && core.state == ConnectionState::ShuttingDown {
            self.finish_shutdown(core);
        }
    }

    fn finish_shutdown(&self, mut core: MutexGuard<'_, Core>) {
        core.teardown_transport();
        core.tracker.fail_all(OperationFailure::ConnectionClosed);
        let next = if core.shutdown_final {
            ConnectionState::Terminated
        } else {
            ConnectionState::Disconnected
        };
        core.transition(next);
        core.missed_pings = 0;
        core.shutdown_started = None;
        let waiters = std::mem::take(&mut core.shutdown_waiters);
        tracing::info!(state = ?next, "Connection closed");
        drop(core);

        for waiter in waiters {
            waiter.complete(Ok(()));
        }
    }
}
