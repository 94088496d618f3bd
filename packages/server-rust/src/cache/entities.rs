//! Cache entities: inodes, directories, dentries.
//!
//! Entities are stored in id-keyed map arenas inside [`super::MetaCache`]
//! and referenced everywhere else by their stable identifiers, never by
//! ownership. Each entity carries its own authority bit, replica set, and
//! pin accounting; subtree-level state (authority pairs, bounds, freeze)
//! lives in the cache's subtree registry.

use std::collections::BTreeMap;

use grove_core::{
    Capability, FileLock, HardLock, InodeId, InodeKind, LockState, MdsId, ReplicaNonce,
};
use grove_core::DirId;

// ---------------------------------------------------------------------------
// Inode
// ---------------------------------------------------------------------------

/// An in-cache inode.
#[derive(Debug, Clone)]
pub struct Inode {
    pub ino: InodeId,
    pub kind: InodeKind,
    /// Primary linkage: the directory and dentry name this inode hangs from.
    /// `None` for the filesystem root.
    pub parent: Option<(DirId, String)>,
    /// True while this rank is the inode's authority.
    pub auth: bool,
    pub dirty: bool,
    pub hard: LockState<HardLock>,
    pub file: LockState<FileLock>,
    pub caps: Vec<Capability>,
    /// Which other ranks hold a replica, and at which nonce.
    pub cached_by: BTreeMap<MdsId, ReplicaNonce>,
    /// The nonce of our own incarnation of this inode.
    pub replica_nonce: ReplicaNonce,
    /// Path-pin count: while nonzero, this inode and its ancestors must not
    /// be evicted.
    pub path_pins: u32,
    /// Held on the root inode of an inbound migration, DISCOVERED through
    /// `import_finish` or reverse.
    pub importing_pin: bool,
}

impl Inode {
    /// A fresh authoritative inode with stable locks and no replicas.
    #[must_use]
    pub fn new_auth(ino: InodeId, kind: InodeKind, parent: Option<(DirId, String)>) -> Self {
        Self {
            ino,
            kind,
            parent,
            auth: true,
            dirty: false,
            hard: LockState::stable(HardLock::Sync),
            file: LockState::stable(FileLock::Sync),
            caps: Vec::new(),
            cached_by: BTreeMap::new(),
            replica_nonce: ReplicaNonce(0),
            path_pins: 0,
            importing_pin: false,
        }
    }

    /// A replica of an inode whose authority lives elsewhere.
    #[must_use]
    pub fn new_replica(ino: InodeId, kind: InodeKind, parent: Option<(DirId, String)>) -> Self {
        Self {
            auth: false,
            ..Self::new_auth(ino, kind, parent)
        }
    }
}

// ---------------------------------------------------------------------------
// Dentry
// ---------------------------------------------------------------------------

/// Linkage of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DentryLink {
    /// Negative entry: the name is known absent.
    Null,
    /// Remote (hard) link: the primary inode lives in another directory.
    Remote(InodeId),
    /// Primary link: the inode hangs here.
    Primary(InodeId),
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct Dentry {
    pub link: DentryLink,
    pub auth: bool,
    pub dirty: bool,
    pub replicas: BTreeMap<MdsId, ReplicaNonce>,
}

impl Dentry {
    #[must_use]
    pub fn new(link: DentryLink, auth: bool) -> Self {
        Self {
            link,
            auth,
            dirty: false,
            replicas: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Dir
// ---------------------------------------------------------------------------

/// Freeze state of a directory that roots a (candidate) subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FreezeState {
    #[default]
    None,
    /// Quiescing: no new auth-pins; waiting for existing ones to drain.
    Freezing,
    Frozen,
}

/// An in-cache directory.
#[derive(Debug, Clone)]
pub struct Dir {
    pub id: DirId,
    /// True while this rank is the directory's authority.
    pub auth: bool,
    /// True when every entry of the directory is in cache.
    pub complete: bool,
    /// Intra-directory sharding flag. Hashed directories cannot migrate.
    pub hashed: bool,
    pub dirty: bool,
    pub entries: BTreeMap<String, Dentry>,
    pub replicas: BTreeMap<MdsId, ReplicaNonce>,
    pub freeze: FreezeState,
    /// Auth-pins held by in-flight operations; freezing waits on these.
    pub auth_pins: u32,
    /// Held on each bound of an outbound migration, PREP through terminal.
    pub export_bound_pin: bool,
    /// Held on each bound of an inbound migration, PREP through terminal.
    pub import_bound_pin: bool,
}

impl Dir {
    #[must_use]
    pub fn new(id: DirId, auth: bool) -> Self {
        Self {
            id,
            auth,
            complete: true,
            hashed: false,
            dirty: false,
            entries: BTreeMap::new(),
            replicas: BTreeMap::new(),
            freeze: FreezeState::default(),
            auth_pins: 0,
            export_bound_pin: false,
            import_bound_pin: false,
        }
    }

    /// Number of live (non-null) entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries
            .values()
            .filter(|d| d.link != DentryLink::Null)
            .count()
    }

    #[must_use]
    pub fn is_freezing(&self) -> bool {
        self.freeze == FreezeState::Freezing
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.freeze == FreezeState::Frozen
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_size_ignores_null_entries() {
        let mut dir = Dir::new(DirId(0x10), true);
        dir.entries
            .insert("a".to_string(), Dentry::new(DentryLink::Primary(InodeId(2)), true));
        dir.entries
            .insert("b".to_string(), Dentry::new(DentryLink::Null, true));
        dir.entries
            .insert("c".to_string(), Dentry::new(DentryLink::Remote(InodeId(3)), true));
        assert_eq!(dir.size(), 2);
    }

    #[test]
    fn replica_inode_is_not_auth() {
        let inode = Inode::new_replica(InodeId(5), InodeKind::File, None);
        assert!(!inode.auth);
        let inode = Inode::new_auth(InodeId(5), InodeKind::File, None);
        assert!(inode.auth);
    }

    #[test]
    fn fresh_dir_is_unfrozen() {
        let dir = Dir::new(DirId(1), true);
        assert!(!dir.is_freezing());
        assert!(!dir.is_frozen());
    }
}
