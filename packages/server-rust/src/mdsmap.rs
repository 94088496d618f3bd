//! Cluster membership map and beacon-based liveness.
//!
//! The membership service owns which ranks exist and what lifecycle state
//! each is in. The Migrator consumes a narrow contract from it: whether the
//! cluster is degraded, whether a given rank is active-or-stopping (and so
//! may act as a bystander), and failure declarations fanned out when a rank
//! stops beaconing.
//!
//! The map itself is an immutable versioned snapshot published through
//! `ArcSwap`, so readers on any task never block the updater.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use grove_core::MdsId;

// ---------------------------------------------------------------------------
// MdsState / MdsMap
// ---------------------------------------------------------------------------

/// Lifecycle state of one MDS rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MdsState {
    Starting,
    Active,
    /// Draining its subtrees away before shutdown. Still a valid bystander.
    Stopping,
    Stopped,
    Failed,
}

/// Versioned snapshot of cluster membership.
///
/// The epoch advances on every membership change; stale snapshots are never
/// mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MdsMap {
    pub epoch: u64,
    pub members: BTreeMap<MdsId, MdsState>,
}

impl MdsMap {
    /// A fresh map with the given ranks, all active, at epoch 1.
    #[must_use]
    pub fn with_active(ranks: impl IntoIterator<Item = MdsId>) -> Self {
        Self {
            epoch: 1,
            members: ranks.into_iter().map(|r| (r, MdsState::Active)).collect(),
        }
    }

    /// The cluster is degraded while any rank is failed: authority cannot be
    /// handed off safely until recovery resolves it.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.members.values().any(|s| *s == MdsState::Failed)
    }

    #[must_use]
    pub fn is_active(&self, rank: MdsId) -> bool {
        self.members.get(&rank) == Some(&MdsState::Active)
    }

    /// Ranks in `Active` or `Stopping` participate in the replica protocol
    /// and must be kept consistent as bystanders.
    #[must_use]
    pub fn is_active_or_stopping(&self, rank: MdsId) -> bool {
        matches!(
            self.members.get(&rank),
            Some(MdsState::Active | MdsState::Stopping)
        )
    }

    /// Returns the next epoch's map with `rank` marked failed.
    #[must_use]
    pub fn with_failure(&self, rank: MdsId) -> Self {
        let mut next = self.clone();
        next.epoch += 1;
        next.members.insert(rank, MdsState::Failed);
        next
    }
}

// ---------------------------------------------------------------------------
// MdsMapHandle
// ---------------------------------------------------------------------------

/// Lock-free shared handle to the current membership snapshot.
#[derive(Debug)]
pub struct MdsMapHandle {
    inner: ArcSwap<MdsMap>,
}

impl MdsMapHandle {
    #[must_use]
    pub fn new(map: MdsMap) -> Self {
        Self {
            inner: ArcSwap::new(Arc::new(map)),
        }
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<MdsMap> {
        self.inner.load_full()
    }

    /// Publishes a new snapshot.
    pub fn publish(&self, map: MdsMap) {
        self.inner.store(Arc::new(map));
    }

    /// Marks `rank` failed in a new epoch and publishes it.
    pub fn mark_failed(&self, rank: MdsId) {
        let next = self.current().with_failure(rank);
        tracing::warn!(%rank, epoch = next.epoch, "marking rank failed");
        self.inner.store(Arc::new(next));
    }
}

// ---------------------------------------------------------------------------
// BeaconMonitor
// ---------------------------------------------------------------------------

/// Deadline-based liveness: a rank that has not beaconed within the grace
/// period is declared failed. Declarations fan out to the Migrator via the
/// node loop; the monitor itself only tracks timestamps.
pub struct BeaconMonitor {
    grace_ms: u64,
    last_beacon: RwLock<HashMap<MdsId, u64>>,
}

impl BeaconMonitor {
    #[must_use]
    pub fn new(grace_ms: u64) -> Self {
        Self {
            grace_ms,
            last_beacon: RwLock::new(HashMap::new()),
        }
    }

    /// Records a beacon arrival from `rank`.
    pub fn beacon(&self, rank: MdsId, timestamp_ms: u64) {
        self.last_beacon.write().insert(rank, timestamp_ms);
    }

    /// Timestamp of the most recent beacon from `rank`, if any.
    #[must_use]
    pub fn last_beacon(&self, rank: MdsId) -> Option<u64> {
        self.last_beacon.read().get(&rank).copied()
    }

    /// Ranks whose grace period has elapsed at `now_ms`. Expired ranks are
    /// removed from tracking so each failure is declared once.
    pub fn take_expired(&self, now_ms: u64) -> Vec<MdsId> {
        let mut last = self.last_beacon.write();
        let expired: Vec<MdsId> = last
            .iter()
            .filter(|(_, &ts)| now_ms.saturating_sub(ts) > self.grace_ms)
            .map(|(&rank, _)| rank)
            .collect();
        for rank in &expired {
            last.remove(rank);
        }
        expired
    }

    /// Stops tracking a rank (e.g., after a graceful stop).
    pub fn remove(&self, rank: MdsId) {
        self.last_beacon.write().remove(&rank);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
