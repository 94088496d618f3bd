//! Inode lock-state algebra.
//!
//! Each primary inode carries two distributed locks: the *hard* lock (name,
//! mode, ownership) and the *file* lock (data and file size). Both are small
//! state machines whose transient "gather" states wait on a set of MDS ranks
//! to revoke their leases. This module provides:
//!
//! - [`HardLock`] / [`FileLock`]: the state enums, including gather states
//! - [`LockState`]: a lock state plus its pending gather set
//! - [`HardLock::export_target`] / [`FileLock::export_target`]: the total
//!   mapping applied to every inode when its subtree changes authority
//!
//! The export mapping is the single source of truth for how in-flight lock
//! acquisition collapses when a subtree leaves an MDS: the gather set is
//! dropped wholesale and the state falls to the stable state the gather was
//! converging to, never to a stronger one.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::MdsId;

// ---------------------------------------------------------------------------
// HardLock
// ---------------------------------------------------------------------------

/// State of the hard (name/mode/ownership) lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HardLock {
    Sync,
    Lock,
    /// Gathering read leases back from replicas.
    GatherRead,
}

impl HardLock {
    /// Returns `true` for the transient gather state.
    #[must_use]
    pub fn is_gathering(self) -> bool {
        matches!(self, HardLock::GatherRead)
    }

    /// The stable state this lock lands in when its subtree is exported.
    #[must_use]
    pub fn export_target(self) -> HardLock {
        match self {
            HardLock::Sync => HardLock::Sync,
            HardLock::Lock | HardLock::GatherRead => HardLock::Lock,
        }
    }
}

// ---------------------------------------------------------------------------
// FileLock
// ---------------------------------------------------------------------------

/// State of the file (data/size) lock.
///
/// The stable states are `Sync`, `Lock`, `Mixed`, and `Loner`; the rest are
/// gathers converging toward one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileLock {
    Sync,
    Lock,
    Mixed,
    /// One client holds exclusive caps.
    Loner,
    GatherRead,
    GatherMixed,
    GatherLoner,
    GatherMixedRead,
    GatherSyncMixed,
    GatherSyncLoner,
    GatherMixedLoner,
}

impl FileLock {
    /// Returns `true` for any transient gather state.
    #[must_use]
    pub fn is_gathering(self) -> bool {
        !matches!(
            self,
            FileLock::Sync | FileLock::Lock | FileLock::Mixed | FileLock::Loner
        )
    }

    /// The stable state this lock lands in when its subtree is exported.
    ///
    /// A `Loner` cannot survive the authority change (the loner client is
    /// told its caps are stale), so it collapses to `Lock` along with the
    /// gathers that were converging on exclusivity. Gathers converging on
    /// `Mixed` keep their target.
    #[must_use]
    pub fn export_target(self) -> FileLock {
        match self {
            FileLock::Sync => FileLock::Sync,
            FileLock::Mixed | FileLock::GatherMixedRead | FileLock::GatherSyncMixed => {
                FileLock::Mixed
            }
            FileLock::Lock
            | FileLock::Loner
            | FileLock::GatherRead
            | FileLock::GatherMixed
            | FileLock::GatherLoner
            | FileLock::GatherSyncLoner
            | FileLock::GatherMixedLoner => FileLock::Lock,
        }
    }
}

// ---------------------------------------------------------------------------
// LockState
// ---------------------------------------------------------------------------

/// A lock state together with the set of ranks its gather is waiting on.
///
/// The gather set is non-empty only while the state is a gather state; the
/// export transition and gather settlement both maintain that invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockState<S> {
    pub state: S,
    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub gather: BTreeSet<MdsId>,
}

impl<S: Copy> LockState<S> {
    /// A stable lock with nothing pending.
    pub fn stable(state: S) -> Self {
        Self {
            state,
            gather: BTreeSet::new(),
        }
    }

    /// A gather in progress, waiting on `waiting_on`.
    pub fn gathering(state: S, waiting_on: impl IntoIterator<Item = MdsId>) -> Self {
        Self {
            state,
            gather: waiting_on.into_iter().collect(),
        }
    }
}

/// The algebra both lock kinds share: every state knows whether it is a
/// gather and which stable state it collapses to on authority change.
pub trait LockAlgebra: Copy {
    fn is_gathering(self) -> bool;
    fn export_target(self) -> Self;
}

impl LockAlgebra for HardLock {
    fn is_gathering(self) -> bool {
        HardLock::is_gathering(self)
    }

    fn export_target(self) -> Self {
        HardLock::export_target(self)
    }
}

impl LockAlgebra for FileLock {
    fn is_gathering(self) -> bool {
        FileLock::is_gathering(self)
    }

    fn export_target(self) -> Self {
        FileLock::export_target(self)
    }
}

impl<S: LockAlgebra> LockState<S> {
    /// Applies the export transition: drop the gather set, collapse to the
    /// stable export target.
    pub fn export(&mut self) {
        self.gather.clear();
        self.state = self.state.export_target();
    }

    /// Removes `ranks` from the gather set; if the gather drains, the lock
    /// settles to its target stable state. Returns `true` if it settled.
    pub fn remove_from_gather(&mut self, ranks: &[MdsId]) -> bool {
        if self.gather.is_empty() {
            return false;
        }
        for rank in ranks {
            self.gather.remove(rank);
        }
        if self.gather.is_empty() {
            self.state = self.state.export_target();
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const ALL_HARD: [HardLock; 3] = [HardLock::Sync, HardLock::Lock, HardLock::GatherRead];

    const ALL_FILE: [FileLock; 11] = [
        FileLock::Sync,
        FileLock::Lock,
        FileLock::Mixed,
        FileLock::Loner,
        FileLock::GatherRead,
        FileLock::GatherMixed,
        FileLock::GatherLoner,
        FileLock::GatherMixedRead,
        FileLock::GatherSyncMixed,
        FileLock::GatherSyncLoner,
        FileLock::GatherMixedLoner,
    ];

    #[test]
    fn hard_gather_read_exports_to_lock() {
        assert_eq!(HardLock::GatherRead.export_target(), HardLock::Lock);
        assert_eq!(HardLock::Sync.export_target(), HardLock::Sync);
        assert_eq!(HardLock::Lock.export_target(), HardLock::Lock);
    }

    #[test]
    fn file_export_targets_match_transition_table() {
        assert_eq!(FileLock::GatherRead.export_target(), FileLock::Lock);
        assert_eq!(FileLock::GatherMixed.export_target(), FileLock::Lock);
        assert_eq!(FileLock::GatherLoner.export_target(), FileLock::Lock);
        assert_eq!(FileLock::Loner.export_target(), FileLock::Lock);
        assert_eq!(FileLock::GatherMixedRead.export_target(), FileLock::Mixed);
        assert_eq!(FileLock::GatherSyncMixed.export_target(), FileLock::Mixed);
        assert_eq!(FileLock::GatherSyncLoner.export_target(), FileLock::Lock);
        assert_eq!(FileLock::GatherMixedLoner.export_target(), FileLock::Lock);
        assert_eq!(FileLock::Sync.export_target(), FileLock::Sync);
        assert_eq!(FileLock::Lock.export_target(), FileLock::Lock);
        assert_eq!(FileLock::Mixed.export_target(), FileLock::Mixed);
    }

    #[test]
    fn export_clears_gather_set() {
        let mut lock =
            LockState::gathering(FileLock::GatherSyncMixed, [MdsId(1), MdsId(2)]);
        lock.export();
        assert!(lock.gather.is_empty());
        assert_eq!(lock.state, FileLock::Mixed);
    }

    #[test]
    fn gather_settles_when_last_rank_removed() {
        let mut lock = LockState::gathering(HardLock::GatherRead, [MdsId(1), MdsId(2)]);
        assert!(!lock.remove_from_gather(&[MdsId(1)]));
        assert_eq!(lock.state, HardLock::GatherRead);
        assert!(lock.remove_from_gather(&[MdsId(2)]));
        assert_eq!(lock.state, HardLock::Lock);
    }

    #[test]
    fn gather_removal_on_stable_lock_is_noop() {
        let mut lock = LockState::stable(FileLock::Sync);
        assert!(!lock.remove_from_gather(&[MdsId(0), MdsId(1)]));
        assert_eq!(lock.state, FileLock::Sync);
    }

    proptest! {
        /// The export target is always a stable state.
        #[test]
        fn export_target_is_stable(idx in 0usize..ALL_FILE.len()) {
            let target = ALL_FILE[idx].export_target();
            prop_assert!(!target.is_gathering());
        }

        /// Exporting is idempotent: a second application changes nothing.
        #[test]
        fn export_is_idempotent(idx in 0usize..ALL_FILE.len()) {
            let once = ALL_FILE[idx].export_target();
            prop_assert_eq!(once.export_target(), once);
        }

        /// Same laws for the hard lock.
        #[test]
        fn hard_export_is_stable_and_idempotent(idx in 0usize..ALL_HARD.len()) {
            let once = ALL_HARD[idx].export_target();
            prop_assert!(!once.is_gathering());
            prop_assert_eq!(once.export_target(), once);
        }
    }
}
