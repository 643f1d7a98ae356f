//! Fan-out of dispatched messages to every member of the message's room.
//!
//! One loop consumes the dispatcher queue. For each envelope it takes a
//! registry snapshot of the room and queues the encoded frame on every
//! member. A member whose send fails is closed and evicted; the rest of the
//! fan-out continues. Delivery is best-effort: no retries, no acknowledgment
//! back to the sender.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::dispatcher::DispatchReceiver;
use crate::protocol::Envelope;
use crate::registry::Registry;

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Deliver a message back to the connection that sent it
    pub echo_to_sender: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            echo_to_sender: true,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_broadcast: u64,
    pub frames_delivered: u64,
    pub connections_evicted: u64,
}

/// Lock-free counters, read via [`BroadcastLoop::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_broadcast: AtomicU64,
    frames_delivered: AtomicU64,
    connections_evicted: AtomicU64,
}

/// Outcome of fanning out a single message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub evicted: usize,
}

#[derive(Clone)]
pub struct BroadcastLoop {
    registry: Registry,
    config: BroadcastConfig,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastLoop {
    pub fn new(registry: Registry, config: BroadcastConfig) -> Self {
        Self {
            registry,
            config,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Consume the dispatcher until every sender is gone.
    pub async fn run(&self, mut rx: DispatchReceiver) {
        log::debug!("Broadcast loop started");
        while let Some(envelope) = rx.recv().await {
            self.deliver(&envelope).await;
        }
        log::debug!("Broadcast loop stopped: dispatcher closed");
    }

    /// Fan one message out to its room.
    pub async fn deliver(&self, envelope: &Envelope) -> DeliveryReport {
        self.stats.messages_broadcast.fetch_add(1, Ordering::Relaxed);

        let room = envelope.room();
        let frame = match envelope.message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Dropping message for room {room:?}: {e}");
                return DeliveryReport::default();
            }
        };

        let mut report = DeliveryReport::default();
        for connection in self.registry.snapshot(room).await {
            if !self.config.echo_to_sender && connection.id() == envelope.origin {
                continue;
            }
            match connection.send_frame(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    match connection.peer_addr() {
                        Some(addr) => log::warn!("Evicting {addr} from room {room:?}: {e}"),
                        None => log::warn!("Evicting connection from room {room:?}: {e}"),
                    }
                    connection.close();
                    self.registry.unregister(room, connection.id()).await;
                    report.evicted += 1;
                }
            }
        }

        self.stats
            .frames_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .connections_evicted
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
        log::trace!(
            "Room {room:?}: delivered {}, evicted {}",
            report.delivered,
            report.evicted
        );
        report
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_broadcast: self.stats.messages_broadcast.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            connections_evicted: self.stats.connections_evicted.load(Ordering::Relaxed),
        }
    }
}
