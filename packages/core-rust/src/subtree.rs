//! Wire records for a serialized subtree.
//!
//! A subtree crosses the wire twice during migration: once as the *spanning
//! context* inside `EXPORT-PREP` (discover records and inode traces that let
//! the importer stitch the region under its existing tree), and once as the
//! *bulk payload* inside `EXPORT` (every directory, dentry, and primary inode
//! of the region). These records are the exact shape of both; the server's
//! codec walks its cache to produce and consume them.
//!
//! Dentry payloads use three markers, mirroring the cache's three dentry
//! linkages: `Null` (negative entry), `Remote` (hard link, inode id only),
//! `Primary` (full inode embedded).

use serde::{Deserialize, Serialize};

use crate::caps::Capability;
use crate::locks::{FileLock, HardLock, LockState};
use crate::types::{DirId, InodeId, MdsId, ReplicaNonce};

// ---------------------------------------------------------------------------
// Inode records
// ---------------------------------------------------------------------------

/// Kind of an inode. Grove only distinguishes what migration needs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InodeKind {
    File,
    Dir,
}

/// A primary inode as encoded into the bulk payload.
///
/// The exporter has already applied the lock export transitions, cleared the
/// cached-by set and the dirty bit, and stamped the export nonce before this
/// record is built; what rides the wire is the post-transition state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InodeRecord {
    pub ino: InodeId,
    pub kind: InodeKind,
    pub hard: LockState<HardLock>,
    pub file: LockState<FileLock>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub caps: Vec<Capability>,
    pub replica_nonce: ReplicaNonce,
}

// ---------------------------------------------------------------------------
// Dentry records
// ---------------------------------------------------------------------------

/// The three dentry payload markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "marker", rename_all = "UPPERCASE")]
pub enum DentryPayload {
    /// `N` — negative entry.
    N,
    /// `L` — remote (hard) link: inode id only, the primary lives elsewhere.
    L { ino: InodeId },
    /// `I` — primary link with the full inode embedded.
    I { inode: InodeRecord },
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DentryRecord {
    pub name: String,
    /// Per-dentry replica set: which ranks hold a replica, at which nonce.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub replicas: Vec<(MdsId, ReplicaNonce)>,
    pub payload: DentryPayload,
}

// ---------------------------------------------------------------------------
// Directory records and the bulk payload
// ---------------------------------------------------------------------------

/// One directory of the subtree, with all of its entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirRecord {
    pub dir: DirId,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub replicas: Vec<(MdsId, ReplicaNonce)>,
    pub dentries: Vec<DentryRecord>,
}

/// The full bulk payload of an `EXPORT` message: every directory of the
/// region, root first, bounds excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPayload {
    pub root: DirId,
    pub dirs: Vec<DirRecord>,
}

impl ExportPayload {
    /// Serializes to the MsgPack byte stream carried by the `EXPORT` message.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Parses the byte stream back. The exporter uses this on its own buffer
    /// when reversing a failed export; the importer uses it on arrival.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Spanning context (EXPORT-PREP)
// ---------------------------------------------------------------------------

/// Enough to instantiate a directory (and its inode) the receiver has never
/// seen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirDiscover {
    pub dir: DirId,
    pub ino: InodeId,
}

/// One step of an inode trace: which dentry of which directory leads to
/// which inode, walking from the subtree root toward a bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStep {
    pub dir: DirId,
    pub dentry: String,
    pub ino: InodeId,
}

/// The spanning context for one bound: the discover record for each ancestor
/// directory between the root and the bound, plus the trace linking them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundTrace {
    pub bound: DirId,
    pub steps: Vec<TraceStep>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub dirs: Vec<DirDiscover>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::caps::ClientId;
    use crate::types::EXPORT_NONCE;

    use super::*;

    fn sample_inode(ino: u64) -> InodeRecord {
        InodeRecord {
            ino: InodeId(ino),
            kind: InodeKind::File,
            hard: LockState::stable(HardLock::Lock),
            file: LockState::stable(FileLock::Mixed),
            caps: vec![Capability::new(ClientId(4), 3)],
            replica_nonce: EXPORT_NONCE,
        }
    }

    fn sample_payload() -> ExportPayload {
        ExportPayload {
            root: DirId(0x10),
            dirs: vec![DirRecord {
                dir: DirId(0x10),
                replicas: vec![(MdsId(2), ReplicaNonce(3))],
                dentries: vec![
                    DentryRecord {
                        name: "gone".to_string(),
                        replicas: vec![],
                        payload: DentryPayload::N,
                    },
                    DentryRecord {
                        name: "link".to_string(),
                        replicas: vec![(MdsId(1), ReplicaNonce(1))],
                        payload: DentryPayload::L { ino: InodeId(0x99) },
                    },
                    DentryRecord {
                        name: "file".to_string(),
                        replicas: vec![],
                        payload: DentryPayload::I {
                            inode: sample_inode(0x20),
                        },
                    },
                ],
            }],
        }
    }

    #[test]
    fn payload_byte_round_trip() {
        let payload = sample_payload();
        let bytes = payload.to_bytes().expect("encode");
        let decoded = ExportPayload::from_bytes(&bytes).expect("decode");
        assert_eq!(payload, decoded);
    }

    #[test]
    fn dentry_markers_round_trip_individually() {
        for payload in [
            DentryPayload::N,
            DentryPayload::L { ino: InodeId(5) },
            DentryPayload::I {
                inode: sample_inode(6),
            },
        ] {
            let bytes = rmp_serde::to_vec_named(&payload).expect("serialize");
            let decoded: DentryPayload = rmp_serde::from_slice(&bytes).expect("deserialize");
            assert_eq!(payload, decoded);
        }
    }

    #[test]
    fn bound_trace_round_trip() {
        let trace = BoundTrace {
            bound: DirId(0x40),
            steps: vec![TraceStep {
                dir: DirId(0x10),
                dentry: "mid".to_string(),
                ino: InodeId(0x40),
            }],
            dirs: vec![DirDiscover {
                dir: DirId(0x10),
                ino: InodeId(0x10),
            }],
        };
        let bytes = rmp_serde::to_vec_named(&trace).expect("serialize");
        let decoded: BoundTrace = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(trace, decoded);
    }

    #[test]
    fn empty_caps_are_omitted_from_the_wire() {
        let mut inode = sample_inode(1);
        inode.caps.clear();
        let json = serde_json::to_string(&inode).expect("json");
        assert!(!json.contains("caps"), "empty caps should be skipped: {json}");
    }
}
