//! Client capability state and the capability messages sent during migration.
//!
//! A capability grants a client rights (read, cache, write, buffer) on one
//! inode, issued by that inode's authoritative MDS. When a subtree migrates,
//! the old authority tells each affected client its caps are **stale** and
//! the new authority tells it to **reap** them against the new issuer, so the
//! client reissues its requests to the right rank.

use serde::{Deserialize, Serialize};

use crate::types::{InodeId, MdsId};

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// Client session identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ClientId(pub u64);

/// Capability bits. Kept as a raw mask; the lock subsystem interprets them.
pub mod cap_bits {
    pub const READ: u32 = 1;
    pub const CACHE: u32 = 2;
    pub const WRITE: u32 = 4;
    pub const BUFFER: u32 = 8;
}

/// One client's capability on one inode.
///
/// `issued` is what the client currently holds; `pending` is what the lock
/// state would allow. Both ride the wire inside the exported inode record so
/// the importer can reconstruct the table before clients reissue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub client: ClientId,
    pub issued: u32,
    pub pending: u32,
}

impl Capability {
    #[must_use]
    pub fn new(client: ClientId, issued: u32) -> Self {
        Self {
            client,
            issued,
            pending: issued,
        }
    }
}

// ---------------------------------------------------------------------------
// CapMessage
// ---------------------------------------------------------------------------

/// Capability message to a client, emitted while a subtree changes hands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapMessage {
    /// From the exporter: the caps this client holds on `ino` are stale and
    /// must be reissued against the new authority.
    Stale { client: ClientId, ino: InodeId },
    /// From the importer: reap the caps previously issued by `old_auth`;
    /// this rank is the issuer now.
    Reap {
        client: ClientId,
        ino: InodeId,
        old_auth: MdsId,
    },
}

impl CapMessage {
    /// The client this message is addressed to.
    #[must_use]
    pub fn client(&self) -> ClientId {
        match self {
            CapMessage::Stale { client, .. } | CapMessage::Reap { client, .. } => *client,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_capability_has_pending_equal_to_issued() {
        let cap = Capability::new(ClientId(9), cap_bits::READ | cap_bits::CACHE);
        assert_eq!(cap.issued, cap.pending);
    }

    #[test]
    fn cap_message_client_accessor() {
        let stale = CapMessage::Stale {
            client: ClientId(1),
            ino: InodeId(10),
        };
        let reap = CapMessage::Reap {
            client: ClientId(2),
            ino: InodeId(10),
            old_auth: MdsId(0),
        };
        assert_eq!(stale.client(), ClientId(1));
        assert_eq!(reap.client(), ClientId(2));
    }

    #[test]
    fn cap_message_msgpack_round_trip() {
        let msgs = [
            CapMessage::Stale {
                client: ClientId(7),
                ino: InodeId(0x30),
            },
            CapMessage::Reap {
                client: ClientId(7),
                ino: InodeId(0x30),
                old_auth: MdsId(4),
            },
        ];
        for msg in msgs {
            let bytes = rmp_serde::to_vec_named(&msg).expect("serialize");
            let decoded: CapMessage = rmp_serde::from_slice(&bytes).expect("deserialize");
            assert_eq!(msg, decoded);
        }
    }
}
