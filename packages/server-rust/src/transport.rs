//! Inter-MDS message transport.
//!
//! Delivery is best-effort: a send never blocks the protocol, and ordering
//! is guaranteed only between one sender and one destination — messages to
//! distinct destinations may arrive in any interleaving. The queue-backed
//! implementation models exactly that: one FIFO per destination, drained
//! independently by whoever pumps the wire (the node loop in production,
//! the test cluster in tests).

use async_trait::async_trait;
use dashmap::DashMap;

use grove_core::MdsId;

use crate::migrate::MigrationMessage;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A migration message tagged with its sender and destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: MdsId,
    pub to: MdsId,
    pub msg: MigrationMessage,
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Best-effort message send toward a peer rank.
///
/// Implementations must preserve order per `(from, to)` pair and nothing
/// more. Failures are swallowed by design: a lost peer surfaces through the
/// membership service, never through a send error.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// QueueTransport
// ---------------------------------------------------------------------------

/// In-memory transport: per-destination FIFO queues.
///
/// Used by the binary's single-node loop and by the test cluster, which
/// moves envelopes between nodes' queues by hand to control interleavings.
#[derive(Debug, Default)]
pub struct QueueTransport {
    queues: DashMap<MdsId, Vec<Envelope>>,
}

impl QueueTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every message queued for `to`, in send order.
    pub fn drain_to(&self, to: MdsId) -> Vec<Envelope> {
        self.queues
            .remove(&to)
            .map(|(_, queue)| queue)
            .unwrap_or_default()
    }

    /// Takes every queued message, grouped per destination. Destination
    /// order is unspecified, matching the wire's ordering contract.
    pub fn drain_all(&self) -> Vec<Envelope> {
        let destinations: Vec<MdsId> = self.queues.iter().map(|e| *e.key()).collect();
        let mut out = Vec::new();
        for to in destinations {
            out.extend(self.drain_to(to));
        }
        out
    }

    /// Number of messages currently queued across all destinations.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queues.iter().map(|e| e.value().len()).sum()
    }
}

#[async_trait]
impl Transport for QueueTransport {
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        tracing::trace!(
            from = %envelope.from,
            to = %envelope.to,
            kind = envelope.msg.kind(),
            root = %envelope.msg.root(),
            "queueing message"
        );
        self.queues.entry(envelope.to).or_default().push(envelope);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
