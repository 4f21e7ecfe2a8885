//! Background async tasks for a connection
//!
//! Each task is a plain async function bound to one transport session (its
//! generation). Tasks hold a weak reference to the connection so an
//! abandoned connection is not kept alive by its own I/O.

use crate::client::Shared;
use crate::error::{OperationFailure, SessionError};
use crate::handle::Completer;
use crate::packet::Packet;
use crate::transport::{PacketReader, PacketWriter};
use crate::types::PubAck;
use crate::QoS;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, sleep_until, Duration, Instant, MissedTickBehavior};

/// Items consumed by the packet writer task, in order
pub(crate) enum Outbound {
    Packet {
        packet: Packet,
        /// Resolved once the packet is handed to the transport (QoS 0 publish)
        written: Option<Completer<PubAck>>,
    },
    /// Close the transport after everything queued before it is written
    Close,
}

/// Packet writer task - drains the outbound queue into the transport
pub(crate) async fn packet_writer_task(
    shared: Weak<Shared>,
    generation: u64,
    mut writer: Box<dyn PacketWriter>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = queue.recv().await {
        match item {
            Outbound::Packet { packet, written } => {
                let name = packet.name();
                let result = writer.write_packet(packet).await;
                if let Some(written) = written {
                    written.complete(
                        result
                            .clone()
                            .map(|()| PubAck {
                                packet_id: None,
                                qos: QoS::AtMostOnce,
                            })
                            .map_err(|e| {
                                SessionError::operation(
                                    None,
                                    OperationFailure::Transport(e.to_string()),
                                )
                            }),
                    );
                }
                if let Err(e) = result {
                    tracing::error!(error = %e, packet = name, "Error writing packet");
                    if let Some(shared) = shared.upgrade() {
                        shared.transport_failed(generation, e);
                    }
                    return;
                }
            }
            Outbound::Close => {
                if let Err(e) = writer.close().await {
                    tracing::debug!(error = %e, "Error closing transport");
                }
                if let Some(shared) = shared.upgrade() {
                    shared.transport_closed(generation);
                }
                return;
            }
        }
    }
    // Queue dropped: the session was torn down
    let _ = writer.close().await;
}

/// Packet reader task - feeds inbound packets to the state machine in arrival order
pub(crate) async fn packet_reader_task(
    shared: Weak<Shared>,
    generation: u64,
    mut reader: Box<dyn PacketReader>,
) {
    loop {
        let result = reader.read_packet().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match result {
            Ok(packet) => {
                tracing::trace!(packet = packet.name(), packet_id = ?packet.packet_id(), "Received packet");
                if !shared.handle_packet(generation, packet) {
                    return;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Error reading packet");
                shared.transport_failed(generation, e);
                return;
            }
        }
    }
}

/// Keepalive task - pings the broker when the link has been idle for a full interval
pub(crate) async fn keepalive_task(shared: Weak<Shared>, generation: u64, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick completes immediately and only marks the interval start
    let mut previous = ticker.tick().await;

    loop {
        let now = ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !shared.keepalive_tick(generation, previous) {
            return;
        }
        previous = now;
    }
}

/// Connect attempt task - waits out the backoff, then runs one attempt
pub(crate) async fn connect_attempt_task(shared: Weak<Shared>, generation: u64, delay: Duration) {
    if !delay.is_zero() {
        tracing::debug!(?delay, "Waiting before connect attempt");
        sleep(delay).await;
    }
    if let Some(shared) = shared.upgrade() {
        shared.run_attempt(generation).await;
    }
}

/// CONNACK deadline timer for the attempt bound to `generation`
pub(crate) async fn connect_timer_task(shared: Weak<Shared>, generation: u64, deadline: Instant) {
    sleep_until(deadline).await;
    if let Some(shared) = shared.upgrade() {
        shared.fail_attempt(generation, SessionError::Timeout);
    }
}

/// PINGRESP timeout timer for ping `seq`
pub(crate) async fn ping_timer_task(
    shared: Weak<Shared>,
    generation: u64,
    seq: u64,
    timeout: Duration,
) {
    sleep(timeout).await;
    if let Some(shared) = shared.upgrade() {
        shared.ping_timed_out(generation, seq);
    }
}

/// Ack timeout timer for a tracked operation
pub(crate) async fn operation_timer_task(shared: Weak<Shared>, seq: u64, timeout: Duration) {
    sleep(timeout).await;
    if let Some(shared) = shared.upgrade() {
        shared.operation_timed_out(seq);
    }
}

/// Upper bound on how long a graceful shutdown waits for the writer
pub(crate) async fn shutdown_timer_task(shared: Weak<Shared>, generation: u64, timeout: Duration) {
    sleep(timeout).await;
    if let Some(shared) = shared.upgrade() {
        shared.transport_closed(generation);
    }
}
