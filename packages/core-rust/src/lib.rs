//! Grove Core — metadata identifiers, lock algebra, and subtree codec records.
//!
//! This crate is the pure data layer shared by every Grove MDS:
//!
//! - **Types** ([`types`]): `MdsId`, `InodeId`, `DirId`, `Authority`,
//!   replica nonces
//! - **Locks** ([`locks`]): the hard/file lock algebra and the export
//!   transition applied when a subtree changes authority
//! - **Caps** ([`caps`]): per-client capability state and the `Stale`/`Reap`
//!   client messages issued during migration
//! - **Subtree** ([`subtree`]): the wire records for a serialized subtree —
//!   bulk payload, dentry markers, and the `EXPORT-PREP` spanning context

pub mod caps;
pub mod locks;
pub mod subtree;
pub mod types;

// Types
pub use types::{Authority, DirId, InodeId, MdsId, ReplicaNonce, EXPORT_NONCE, ROOT_INO};

// Locks
pub use locks::{FileLock, HardLock, LockAlgebra, LockState};

// Caps
pub use caps::{cap_bits, CapMessage, Capability, ClientId};

// Subtree
pub use subtree::{
    BoundTrace, DentryPayload, DentryRecord, DirDiscover, DirRecord, ExportPayload, InodeKind,
    InodeRecord, TraceStep,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    #[test]
    fn export_nonce_is_stable_across_the_wire() {
        let bytes = rmp_serde::to_vec(&EXPORT_NONCE).expect("serialize");
        let decoded: ReplicaNonce = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(decoded, EXPORT_NONCE);
    }

    #[test]
    fn reexports_accessible() {
        let _auth = Authority::ambiguous(MdsId(0), MdsId(1));
        let _lock = LockState::stable(FileLock::Sync);
        let _cap = Capability::new(ClientId(1), cap_bits::READ);
        let _marker = DentryPayload::N;
        let _root: DirId = ROOT_INO.into();
    }
}
