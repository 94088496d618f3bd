//! Stable metadata identifiers and subtree authority.
//!
//! Every cache entity in a Grove cluster is addressed by a stable identifier
//! that survives migration: inodes by [`InodeId`], directories by [`DirId`]
//! (derived from the directory inode's number), MDS nodes by [`MdsId`].
//! These are the shared contract between the cache, the journal, and the
//! migration wire messages — all three key their records by the same ids.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// MdsId
// ---------------------------------------------------------------------------

/// Rank of a metadata server within the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct MdsId(pub u16);

impl fmt::Display for MdsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mds{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// InodeId / DirId
// ---------------------------------------------------------------------------

/// Inode number. Globally unique and never reused across a filesystem's life.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct InodeId(pub u64);

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ino:{:#x}", self.0)
    }
}

/// The root directory's inode number.
pub const ROOT_INO: InodeId = InodeId(1);

/// Identity of a directory. Derived from the directory inode's number, so a
/// directory and its inode share one stable identity across the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct DirId(pub u64);

impl DirId {
    /// The inode backing this directory.
    #[must_use]
    pub fn ino(self) -> InodeId {
        InodeId(self.0)
    }
}

impl From<InodeId> for DirId {
    fn from(ino: InodeId) -> Self {
        DirId(ino.0)
    }
}

impl fmt::Display for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dir:{:#x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ReplicaNonce
// ---------------------------------------------------------------------------

/// Distinguishes successive replica incarnations of one cache entity so a
/// stale reference from an earlier incarnation can be detected and dropped.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ReplicaNonce(pub u32);

/// Well-known nonce stamped on every inode while it crosses the wire during
/// a subtree export. The exporter sets it before encoding and the importer
/// records the exporter's replica with the same value, so the replica record
/// round-trips without a handshake.
pub const EXPORT_NONCE: ReplicaNonce = ReplicaNonce(1000);

// ---------------------------------------------------------------------------
// Authority
// ---------------------------------------------------------------------------

/// The authority pair of a subtree, from the viewpoint of one MDS.
///
/// Outside migration the pair resolves to a single rank (`second` is
/// `None`, the wire's `UNKNOWN`). While a subtree is in flight the pair is
/// temporarily `(exporter, importer)`; every MDS observing that window sees
/// both ranks until the protocol resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authority {
    pub primary: MdsId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub second: Option<MdsId>,
}

impl Authority {
    /// A resolved, single-rank authority.
    #[must_use]
    pub fn sole(primary: MdsId) -> Self {
        Self {
            primary,
            second: None,
        }
    }

    /// The two-rank pair observable only during the export/ack window.
    #[must_use]
    pub fn ambiguous(primary: MdsId, second: MdsId) -> Self {
        Self {
            primary,
            second: Some(second),
        }
    }

    /// Returns `true` while the pair carries two ranks.
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        self.second.is_some()
    }

    /// Returns `true` if `mds` appears anywhere in the pair.
    #[must_use]
    pub fn includes(&self, mds: MdsId) -> bool {
        self.primary == mds || self.second == Some(mds)
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.second {
            Some(second) => write!(f, "({},{})", self.primary, second),
            None => write!(f, "({},unknown)", self.primary),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
