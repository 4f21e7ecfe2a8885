//! Mutable session state guarded by the connection lock

use crate::client::retry::ReconnectPolicy;
use crate::error::{Result, SessionError};
use crate::handle::Completer;
use crate::packet::Packet;
use crate::session::subscription::SubscriptionRouter;
use crate::session::tracker::OperationTracker;
use crate::tasks::Outbound;
use crate::types::{ConnectionState, PubAck};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Why the current connect attempt was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptKind {
    /// Application `connect()`
    Connect,
    /// Automatic or application-requested reconnection
    Reconnect,
}

/// Background tasks bound to the current transport session
#[derive(Default)]
pub(crate) struct SessionTasks {
    pub(crate) attempt: Option<JoinHandle<()>>,
    pub(crate) connect_timer: Option<JoinHandle<()>>,
    pub(crate) reader: Option<JoinHandle<()>>,
    pub(crate) keepalive: Option<JoinHandle<()>>,
    pub(crate) ping_timer: Option<JoinHandle<()>>,
}

impl SessionTasks {
    pub(crate) fn abort_all(&mut self) {
        for task in [
            self.attempt.take(),
            self.connect_timer.take(),
            self.reader.take(),
            self.keepalive.take(),
            self.ping_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

pub(crate) struct Core {
    pub(crate) state: ConnectionState,
    pub(crate) tracker: OperationTracker,
    pub(crate) router: SubscriptionRouter,
    pub(crate) policy: ReconnectPolicy,
    /// Failed reconnect attempts since the last accepted CONNACK
    pub(crate) reconnect_attempt: u32,
    /// Transport session counter; events tagged with an older value are stale
    pub(crate) generation: u64,
    pub(crate) attempt: Option<AttemptKind>,
    pub(crate) connect_attempted: bool,
    pub(crate) outbound: Option<mpsc::UnboundedSender<Outbound>>,
    /// Last time a packet other than PINGREQ was queued
    pub(crate) last_send: Instant,
    pub(crate) missed_pings: u32,
    pub(crate) ping_explicit: bool,
    /// QoS 2 packet ids delivered to callbacks and awaiting PUBREL
    pub(crate) inbound_qos2: HashSet<u16>,
    pub(crate) tasks: SessionTasks,
    pub(crate) shutdown_waiters: Vec<Completer<()>>,
    pub(crate) shutdown_final: bool,
    /// When the pending shutdown began
    pub(crate) shutdown_started: Option<std::time::Instant>,
}

impl Core {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            tracker: OperationTracker::new(),
            router: SubscriptionRouter::new(),
            policy,
            reconnect_attempt: 0,
            generation: 0,
            attempt: None,
            connect_attempted: false,
            outbound: None,
            last_send: Instant::now(),
            missed_pings: 0,
            ping_explicit: false,
            inbound_qos2: HashSet::new(),
            tasks: SessionTasks::default(),
            shutdown_waiters: Vec::new(),
            shutdown_final: true,
            shutdown_started: None,
        }
    }

    /// Fails with `InvalidState` unless the connection is in `expected`
    pub(crate) fn require(&self, expected: ConnectionState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    pub(crate) fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state,
        }
    }

    pub(crate) fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {next:?}",
            self.state
        );
        tracing::debug!(from = ?self.state, to = ?next, "Connection state transition");
        self.state = next;
    }

    /// Queues a packet for the writer task
    ///
    /// A closed queue means the transport is already gone; the reader side
    /// reports that failure, so the packet is dropped here.
    pub(crate) fn send(&mut self, packet: Packet, written: Option<Completer<PubAck>>) {
        let Some(outbound) = &self.outbound else {
            tracing::debug!(packet = packet.name(), "No transport, packet dropped");
            return;
        };
        tracing::trace!(packet = packet.name(), packet_id = ?packet.packet_id(), "Queueing packet");
        let is_ping = matches!(packet, Packet::PingReq);
        if outbound.send(Outbound::Packet { packet, written }).is_err() {
            tracing::debug!("Writer task gone, packet dropped");
        }
        if !is_ping {
            self.last_send = Instant::now();
        }
    }

    /// Stops every task of the current transport session and releases the writer
    pub(crate) fn teardown_transport(&mut self) {
        self.tasks.abort_all();
        self.outbound = None;
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.tasks.abort_all();
    }
}
