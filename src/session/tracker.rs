//! Pending operation table
//!
//! Every request that expects a broker acknowledgement is registered here
//! under its packet identifier and stays until it resolves exactly once:
//! with the matching ack, with a per-operation failure, or in bulk through
//! [`OperationTracker::fail_all`]. CONNECT and PINGREQ carry no packet
//! identifier and occupy a dedicated single-request slot each.

use crate::error::{OperationFailure, Result, SessionError};
use crate::handle::Completer;
use crate::packet::SubAckReturnCode;
use crate::packet_id::PacketIdAllocator;
use crate::session::subscription::PublishCallback;
use crate::types::{ConnAck, PubAck, SubAck, UnsubAck};
use crate::QoS;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Subscribe,
    Unsubscribe,
    Publish,
    Ping,
    Connect,
    Disconnect,
}

/// What to do with the operation once its acknowledgement arrives
pub(crate) enum Completion {
    Subscribe {
        topic: String,
        requested: QoS,
        callback: PublishCallback,
        done: Completer<SubAck>,
    },
    Unsubscribe {
        topic: String,
        done: Completer<UnsubAck>,
    },
    Publish {
        qos: QoS,
        /// PUBREC seen and PUBREL sent (QoS 2 only)
        released: bool,
        done: Completer<PubAck>,
    },
}

impl Completion {
    fn kind(&self) -> OperationKind {
        match self {
            Self::Subscribe { .. } => OperationKind::Subscribe,
            Self::Unsubscribe { .. } => OperationKind::Unsubscribe,
            Self::Publish { .. } => OperationKind::Publish,
        }
    }

    fn fail(self, error: SessionError) {
        match self {
            Self::Subscribe { done, .. } => done.complete(Err(error)),
            Self::Unsubscribe { done, .. } => done.complete(Err(error)),
            Self::Publish { done, .. } => done.complete(Err(error)),
        }
    }
}

/// An outstanding request awaiting its acknowledgement
pub(crate) struct PendingOperation {
    seq: u64,
    packet_id: u16,
    created_at: Instant,
    completion: Completion,
}

/// Snapshot of one outstanding request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSummary {
    /// `None` for CONNECT, PINGREQ and DISCONNECT
    pub packet_id: Option<u16>,
    pub kind: OperationKind,
    pub created_at: Instant,
}

/// Acknowledgement events matched by packet identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ack {
    SubAck(SubAckReturnCode),
    UnsubAck,
    PubAck,
    PubRec,
    PubComp,
}

/// Follow-up the state machine must perform after a resolution
pub(crate) enum Resolved {
    Subscribed {
        filter: String,
        qos: QoS,
        callback: PublishCallback,
    },
    SubscribeRejected,
    Unsubscribed {
        filter: String,
    },
    Published,
    /// QoS 2 PUBREC accepted, PUBREL must be sent
    Release,
}

/// Identifier-less request slot (CONNECT, PINGREQ); late callers join the
/// outstanding request instead of issuing a second one
pub(crate) struct PendingRequest<T> {
    seq: u64,
    created_at: Instant,
    waiters: Vec<Completer<T>>,
}

impl<T: Clone> PendingRequest<T> {
    fn new(seq: u64) -> Self {
        Self {
            seq,
            created_at: Instant::now(),
            waiters: Vec::new(),
        }
    }

    fn resolve(self, result: &Result<T>) {
        for waiter in self.waiters {
            waiter.complete(result.clone());
        }
    }
}

/// Packet identifier allocation plus the pending operation table
#[derive(Default)]
pub struct OperationTracker {
    ids: PacketIdAllocator,
    pending: HashMap<u16, PendingOperation>,
    connect: Option<PendingRequest<ConnAck>>,
    ping: Option<PendingRequest<()>>,
    next_seq: u64,
}

impl OperationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a packet identifier not currently outstanding
    ///
    /// # Errors
    ///
    /// Returns `SessionError::IdExhausted` if all 65535 ids are outstanding
    pub fn allocate_id(&mut self) -> Result<u16> {
        let pending = &self.pending;
        self.ids.allocate(|id| pending.contains_key(&id))
    }

    /// Registers a pending operation under `packet_id`, returning its sequence number
    pub(crate) fn register(&mut self, packet_id: u16, completion: Completion) -> Result<u64> {
        if packet_id == 0 || self.pending.contains_key(&packet_id) {
            return Err(SessionError::PacketIdInUse(packet_id));
        }
        let seq = self.bump_seq();
        tracing::trace!(packet_id, kind = ?completion.kind(), "Registered pending operation");
        self.pending.insert(
            packet_id,
            PendingOperation {
                seq,
                packet_id,
                created_at: Instant::now(),
                completion,
            },
        );
        Ok(seq)
    }

    /// Matches an acknowledgement with its pending operation
    ///
    /// Unknown ids and acks of the wrong kind are logged and ignored so a
    /// duplicate or late ack never disturbs the session.
    pub(crate) fn resolve(&mut self, packet_id: u16, ack: Ack) -> Option<Resolved> {
        let Some(op) = self.pending.remove(&packet_id) else {
            tracing::warn!(packet_id, ?ack, "Acknowledgement for unknown packet id");
            return None;
        };
        let PendingOperation {
            seq,
            created_at,
            completion,
            ..
        } = op;

        let unmatched = match (completion, ack) {
            (
                Completion::Subscribe {
                    topic,
                    requested,
                    callback,
                    done,
                },
                Ack::SubAck(code),
            ) => {
                return Some(match code {
                    SubAckReturnCode::Granted(qos) => {
                        if qos < requested {
                            tracing::debug!(packet_id, ?requested, granted = ?qos, "Broker downgraded subscription QoS");
                        }
                        done.complete(Ok(SubAck {
                            packet_id,
                            topic: topic.clone(),
                            qos,
                        }));
                        Resolved::Subscribed {
                            filter: topic,
                            qos,
                            callback,
                        }
                    }
                    SubAckReturnCode::Failure => {
                        tracing::warn!(packet_id, topic = %topic, "Subscription rejected");
                        done.complete(Err(SessionError::SubscriptionRejected { packet_id }));
                        Resolved::SubscribeRejected
                    }
                });
            }
            (Completion::Unsubscribe { topic, done }, Ack::UnsubAck) => {
                done.complete(Ok(UnsubAck {
                    packet_id,
                    topic: topic.clone(),
                }));
                return Some(Resolved::Unsubscribed { filter: topic });
            }
            (
                Completion::Publish {
                    qos: QoS::AtLeastOnce,
                    done,
                    ..
                },
                Ack::PubAck,
            )
            | (
                Completion::Publish {
                    qos: QoS::ExactlyOnce,
                    released: true,
                    done,
                },
                Ack::PubComp,
            ) => {
                let qos = if ack == Ack::PubAck {
                    QoS::AtLeastOnce
                } else {
                    QoS::ExactlyOnce
                };
                done.complete(Ok(PubAck {
                    packet_id: Some(packet_id),
                    qos,
                }));
                return Some(Resolved::Published);
            }
            (
                Completion::Publish {
                    qos: QoS::ExactlyOnce,
                    done,
                    ..
                },
                Ack::PubRec,
            ) => {
                // A repeated PUBREC gets another PUBREL
                self.pending.insert(
                    packet_id,
                    PendingOperation {
                        seq,
                        packet_id,
                        created_at,
                        completion: Completion::Publish {
                            qos: QoS::ExactlyOnce,
                            released: true,
                            done,
                        },
                    },
                );
                return Some(Resolved::Release);
            }
            (completion, _) => completion,
        };

        tracing::warn!(packet_id, ?ack, kind = ?unmatched.kind(), "Acknowledgement does not match pending operation");
        self.pending.insert(
            packet_id,
            PendingOperation {
                seq,
                packet_id,
                created_at,
                completion: unmatched,
            },
        );
        None
    }

    /// Fails a single pending operation; returns whether it was outstanding
    pub(crate) fn fail(&mut self, packet_id: u16, reason: OperationFailure) -> bool {
        match self.pending.remove(&packet_id) {
            Some(op) => {
                op.completion
                    .fail(SessionError::operation(Some(packet_id), reason));
                true
            }
            None => false,
        }
    }

    /// Times out the operation registered with sequence number `seq`, if still pending
    pub(crate) fn expire(&mut self, seq: u64) -> Option<u16> {
        let packet_id = self
            .pending
            .values()
            .find(|op| op.seq == seq)
            .map(|op| op.packet_id)?;
        tracing::warn!(packet_id, "Operation timed out waiting for acknowledgement");
        self.fail(packet_id, OperationFailure::Timeout);
        Some(packet_id)
    }

    /// Resolves every outstanding operation with the same failure
    ///
    /// Returns the number of operations failed.
    pub fn fail_all(&mut self, reason: OperationFailure) -> usize {
        let mut failed = 0;
        for (packet_id, op) in self.pending.drain() {
            op.completion
                .fail(SessionError::operation(Some(packet_id), reason.clone()));
            failed += 1;
        }
        if let Some(connect) = self.connect.take() {
            failed += connect.waiters.len();
            connect.resolve(&Err(SessionError::operation(None, reason.clone())));
        }
        if let Some(ping) = self.ping.take() {
            failed += ping.waiters.len();
            ping.resolve(&Err(SessionError::operation(None, reason.clone())));
        }
        if failed > 0 {
            tracing::debug!(failed, %reason, "Failed all pending operations");
        }
        failed
    }

    /// Starts a connect attempt, returning its sequence number
    ///
    /// Callers already waiting on a previous, unresolved attempt carry over.
    pub(crate) fn begin_connect(&mut self) -> u64 {
        let seq = self.bump_seq();
        let mut request = PendingRequest::new(seq);
        if let Some(previous) = self.connect.take() {
            request.waiters = previous.waiters;
        }
        self.connect = Some(request);
        seq
    }

    /// Adds a caller to the outstanding connect attempt
    pub(crate) fn join_connect(&mut self, waiter: Completer<ConnAck>) -> std::result::Result<(), Completer<ConnAck>> {
        match &mut self.connect {
            Some(request) => {
                request.waiters.push(waiter);
                Ok(())
            }
            None => Err(waiter),
        }
    }

    /// Resolves the connect attempt `seq`; false if it is no longer current
    pub(crate) fn complete_connect(&mut self, seq: u64, result: &Result<ConnAck>) -> bool {
        match self.connect.take() {
            Some(request) if request.seq == seq => {
                request.resolve(result);
                true
            }
            other => {
                self.connect = other;
                false
            }
        }
    }

    pub(crate) fn connect_seq(&self) -> Option<u64> {
        self.connect.as_ref().map(|r| r.seq)
    }

    /// Registers a ping; returns `Some(seq)` when a new PINGREQ must be sent
    pub(crate) fn begin_ping(&mut self, waiter: Option<Completer<()>>) -> Option<u64> {
        let started = if self.ping.is_none() {
            let seq = self.bump_seq();
            self.ping = Some(PendingRequest::new(seq));
            Some(seq)
        } else {
            None
        };
        if let (Some(request), Some(waiter)) = (&mut self.ping, waiter) {
            request.waiters.push(waiter);
        }
        started
    }

    /// Resolves the outstanding ping if its sequence number matches (any if `seq` is None)
    pub(crate) fn complete_ping(&mut self, seq: Option<u64>, result: &Result<()>) -> bool {
        match self.ping.take() {
            Some(request) if seq.map_or(true, |s| s == request.seq) => {
                request.resolve(result);
                true
            }
            other => {
                self.ping = other;
                false
            }
        }
    }

    #[must_use]
    pub fn ping_outstanding(&self) -> bool {
        self.ping.is_some()
    }

    /// Every outstanding request, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<PendingSummary> {
        let slots = [
            (OperationKind::Connect, self.connect.as_ref().map(|r| r.created_at)),
            (OperationKind::Ping, self.ping.as_ref().map(|r| r.created_at)),
        ];
        let mut summary: Vec<PendingSummary> = self
            .pending
            .values()
            .map(|op| PendingSummary {
                packet_id: Some(op.packet_id),
                kind: op.completion.kind(),
                created_at: op.created_at,
            })
            .chain(slots.into_iter().filter_map(|(kind, created_at)| {
                created_at.map(|created_at| PendingSummary {
                    packet_id: None,
                    kind,
                    created_at,
                })
            }))
            .collect();
        summary.sort_by_key(|op| (op.created_at, op.packet_id));
        summary
    }

    /// Whether `packet_id` is awaiting its acknowledgement
    #[must_use]
    pub fn is_outstanding(&self, packet_id: u16) -> bool {
        self.pending.contains_key(&packet_id)
    }

    /// Number of identifier-carrying operations awaiting acknowledgement
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}
