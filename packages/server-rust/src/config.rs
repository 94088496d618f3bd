//! MDS node configuration.

use grove_core::MdsId;

/// Node-level configuration for an MDS.
///
/// Controls identity, beacon liveness, and channel sizing for the node loop.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MdsConfig {
    /// This node's rank within the cluster.
    pub rank: MdsId,
    /// Interval between liveness beacons to the membership map (ms).
    pub beacon_interval_ms: u64,
    /// Grace period without a beacon before a peer is declared failed (ms).
    pub beacon_grace_ms: u64,
    /// Buffer size for the node's event queue.
    pub event_queue_size: usize,
    /// Whether journal entries become durable as soon as they are submitted.
    /// Disabled by tests that exercise failure between submit and flush.
    pub journal_auto_flush: bool,
}

impl Default for MdsConfig {
    fn default() -> Self {
        Self {
            rank: MdsId(0),
            beacon_interval_ms: 4000,
            beacon_grace_ms: 15_000,
            event_queue_size: 256,
            journal_auto_flush: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grace_exceeds_interval() {
        let config = MdsConfig::default();
        assert!(config.beacon_grace_ms > config.beacon_interval_ms);
    }
}
