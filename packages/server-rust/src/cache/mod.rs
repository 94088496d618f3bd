//! Metadata cache: entity arenas, subtree bookkeeping, freeze and pins.
//!
//! The cache is owned by the node task and mutated only from it; the
//! Migrator drives it through the narrow operation set below and never holds
//! references into it across a suspension. Asynchronous cache operations
//! (freeze completion, directory fetch, remote directory open) complete by
//! queueing a [`CacheCompletion`] that the node loop turns into an event, so
//! continuations always re-enter through dispatch with fresh state.

pub mod entities;

use std::collections::{BTreeSet, HashMap};

use grove_core::{Authority, BoundTrace, DirDiscover, DirId, InodeId, InodeKind, MdsId, TraceStep};

pub use entities::{Dentry, DentryLink, Dir, FreezeState, Inode};

// ---------------------------------------------------------------------------
// Subtree registry
// ---------------------------------------------------------------------------

/// Per-subtree bookkeeping.
///
/// Bounds are not stored: a subtree's bound set is derived from the nesting
/// of registered roots, so a new root appearing mid-migration is reflected
/// everywhere at once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubtreeInfo {
    pub auth: Authority,
}

/// Completion of an asynchronous cache operation, delivered through the node
/// loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCompletion {
    /// `freeze_tree` finished quiescing: every auth-pin drained.
    SubtreeFrozen(DirId),
    /// A `fetch_dir` completed; the directory is now complete in cache.
    DirFetched(DirId),
    /// An `open_remote_dir` completed; the directory is now in cache.
    RemoteDirOpened(DirId),
}

// ---------------------------------------------------------------------------
// MetaCache
// ---------------------------------------------------------------------------

/// The in-memory metadata cache of one MDS.
pub struct MetaCache {
    rank: MdsId,
    inodes: HashMap<InodeId, Inode>,
    dirs: HashMap<DirId, Dir>,
    subtrees: HashMap<DirId, SubtreeInfo>,
    ambiguous_imports: HashMap<DirId, BTreeSet<DirId>>,
    delayed_expires: HashMap<DirId, Vec<MdsId>>,
    pending_import_maps: bool,
    completions: Vec<CacheCompletion>,
}

impl MetaCache {
    #[must_use]
    pub fn new(rank: MdsId) -> Self {
        Self {
            rank,
            inodes: HashMap::new(),
            dirs: HashMap::new(),
            subtrees: HashMap::new(),
            ambiguous_imports: HashMap::new(),
            delayed_expires: HashMap::new(),
            pending_import_maps: false,
            completions: Vec::new(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> MdsId {
        self.rank
    }

    /// Drains completions queued since the last call. The node loop turns
    /// each into an event for the Migrator.
    pub fn take_completions(&mut self) -> Vec<CacheCompletion> {
        std::mem::take(&mut self.completions)
    }

    // -- entity arenas ------------------------------------------------------

    pub fn insert_inode(&mut self, inode: Inode) {
        self.inodes.insert(inode.ino, inode);
    }

    pub fn insert_dir(&mut self, dir: Dir) {
        self.dirs.insert(dir.id, dir);
    }

    #[must_use]
    pub fn inode(&self, ino: InodeId) -> Option<&Inode> {
        self.inodes.get(&ino)
    }

    pub fn inode_mut(&mut self, ino: InodeId) -> Option<&mut Inode> {
        self.inodes.get_mut(&ino)
    }

    #[must_use]
    pub fn dir(&self, id: DirId) -> Option<&Dir> {
        self.dirs.get(&id)
    }

    pub fn dir_mut(&mut self, id: DirId) -> Option<&mut Dir> {
        self.dirs.get_mut(&id)
    }

    #[must_use]
    pub fn has_dir(&self, id: DirId) -> bool {
        self.dirs.contains_key(&id)
    }

    // -- pins ---------------------------------------------------------------

    /// Pins the path to `root`: the root inode and every ancestor gain a
    /// path-pin, preventing eviction for the life of a migration. Returns
    /// `false` (no pins taken) if the root inode is not in cache.
    pub fn path_pin(&mut self, root: DirId) -> bool {
        if !self.inodes.contains_key(&root.ino()) {
            return false;
        }
        let mut cursor = Some(root.ino());
        while let Some(ino) = cursor {
            let Some(inode) = self.inodes.get_mut(&ino) else {
                break;
            };
            inode.path_pins += 1;
            cursor = inode.parent.as_ref().map(|(dir, _)| dir.ino());
        }
        true
    }

    /// Releases a path pin taken by [`Self::path_pin`].
    pub fn path_unpin(&mut self, root: DirId) {
        let mut cursor = Some(root.ino());
        while let Some(ino) = cursor {
            let Some(inode) = self.inodes.get_mut(&ino) else {
                break;
            };
            inode.path_pins = inode.path_pins.saturating_sub(1);
            cursor = inode.parent.as_ref().map(|(dir, _)| dir.ino());
        }
    }

    /// Takes an auth-pin on a directory, blocking authority change.
    pub fn auth_pin(&mut self, dir: DirId) {
        if let Some(dir) = self.dirs.get_mut(&dir) {
            assert!(
                !dir.is_frozen(),
                "auth_pin on frozen {}: operations must not enter a frozen subtree",
                dir.id
            );
            dir.auth_pins += 1;
        }
    }

    /// Releases an auth-pin; the last release completes a pending freeze.
    pub fn auth_unpin(&mut self, dir_id: DirId) {
        if let Some(dir) = self.dirs.get_mut(&dir_id) {
            dir.auth_pins = dir.auth_pins.saturating_sub(1);
            if dir.auth_pins == 0 && dir.freeze == FreezeState::Freezing {
                dir.freeze = FreezeState::Frozen;
                self.completions.push(CacheCompletion::SubtreeFrozen(dir_id));
            }
        }
    }

    pub fn pin_export_bound(&mut self, dir: DirId) {
        if let Some(dir) = self.dirs.get_mut(&dir) {
            dir.export_bound_pin = true;
        }
    }

    pub fn unpin_export_bound(&mut self, dir: DirId) {
        if let Some(dir) = self.dirs.get_mut(&dir) {
            dir.export_bound_pin = false;
        }
    }

    pub fn pin_import_bound(&mut self, dir: DirId) {
        if let Some(dir) = self.dirs.get_mut(&dir) {
            dir.import_bound_pin = true;
        }
    }

    pub fn unpin_import_bound(&mut self, dir: DirId) {
        if let Some(dir) = self.dirs.get_mut(&dir) {
            dir.import_bound_pin = false;
        }
    }

    /// Pins the root inode of an inbound migration against eviction.
    pub fn pin_importing(&mut self, root: DirId) {
        if let Some(inode) = self.inodes.get_mut(&root.ino()) {
            inode.importing_pin = true;
        }
    }

    pub fn unpin_importing(&mut self, root: DirId) {
        if let Some(inode) = self.inodes.get_mut(&root.ino()) {
            inode.importing_pin = false;
        }
    }

    // -- freeze -------------------------------------------------------------

    /// Begins quiescing the subtree at `root`. Freezing blocks new
    /// auth-pins; once the existing ones drain, the tree is frozen and a
    /// [`CacheCompletion::SubtreeFrozen`] is queued (immediately, if no pins
    /// are held).
    pub fn freeze_tree(&mut self, root: DirId) {
        let Some(dir) = self.dirs.get_mut(&root) else {
            return;
        };
        if dir.freeze != FreezeState::None {
            return;
        }
        if dir.auth_pins == 0 {
            dir.freeze = FreezeState::Frozen;
            self.completions.push(CacheCompletion::SubtreeFrozen(root));
        } else {
            dir.freeze = FreezeState::Freezing;
        }
    }

    /// Marks a replica-side subtree frozen without quiescing: the importer
    /// freezes a region it is not yet authoritative for, so no local
    /// operations hold auth-pins on it.
    pub fn freeze_tree_nonauth(&mut self, root: DirId) {
        if let Some(dir) = self.dirs.get_mut(&root) {
            dir.freeze = FreezeState::Frozen;
        }
    }

    /// Cancels a freeze in progress or thaws a frozen tree.
    pub fn unfreeze_tree(&mut self, root: DirId) {
        if let Some(dir) = self.dirs.get_mut(&root) {
            dir.freeze = FreezeState::None;
        }
    }

    #[must_use]
    pub fn is_freezing_or_frozen(&self, root: DirId) -> bool {
        self.dirs
            .get(&root)
            .is_some_and(|d| d.freeze != FreezeState::None)
    }

    // -- subtree registry ---------------------------------------------------

    /// Registers (or replaces) a subtree rooted at `root`.
    pub fn register_subtree(&mut self, root: DirId, auth: Authority) {
        self.subtrees.insert(root, SubtreeInfo { auth });
    }

    #[must_use]
    pub fn subtree(&self, root: DirId) -> Option<&SubtreeInfo> {
        self.subtrees.get(&root)
    }

    #[must_use]
    pub fn subtree_auth(&self, root: DirId) -> Option<Authority> {
        self.subtrees.get(&root).map(|s| s.auth)
    }

    /// Sets the authority pair of the subtree at `root`, creating the
    /// subtree entry if this directory was not yet a subtree root.
    pub fn adjust_subtree_auth(&mut self, root: DirId, auth: Authority) {
        tracing::debug!(rank = %self.rank, %root, %auth, "adjust subtree auth");
        match self.subtrees.get_mut(&root) {
            Some(info) => info.auth = auth,
            None => self.register_subtree(root, auth),
        }
    }

    /// True while this rank appears in the subtree's authority pair.
    #[must_use]
    pub fn claims_authority(&self, root: DirId) -> bool {
        self.subtrees
            .get(&root)
            .is_some_and(|s| s.auth.includes(self.rank))
    }

    /// Merges the subtree at `root` into its parent subtree if both now
    /// resolve to the same sole authority. No-op while either is frozen,
    /// freezing, or ambiguous.
    pub fn try_subtree_merge(&mut self, root: DirId) {
        let Some(info) = self.subtrees.get(&root) else {
            return;
        };
        if info.auth.is_ambiguous() || self.is_freezing_or_frozen(root) {
            return;
        }
        let Some(parent_root) = self.containing_subtree_above(root) else {
            return;
        };
        let Some(parent) = self.subtrees.get(&parent_root) else {
            return;
        };
        if parent.auth != info.auth {
            return;
        }
        tracing::debug!(rank = %self.rank, %root, into = %parent_root, "merging subtree");
        self.subtrees.remove(&root);
    }

    /// The bound set of the region rooted at `root`: every registered
    /// subtree root whose ancestor chain reaches `root` before crossing any
    /// other registered root. `root` itself need not be registered yet (the
    /// exporter captures bounds at freeze time, before the authority pair
    /// exists).
    #[must_use]
    pub fn get_subtree_bounds(&self, root: DirId) -> BTreeSet<DirId> {
        let mut out = BTreeSet::new();
        for candidate in self.subtrees.keys() {
            if *candidate == root {
                continue;
            }
            let mut cursor = self
                .inodes
                .get(&candidate.ino())
                .and_then(|i| i.parent.as_ref().map(|(d, _)| *d));
            while let Some(dir) = cursor {
                if dir == root {
                    out.insert(*candidate);
                    break;
                }
                if self.subtrees.contains_key(&dir) {
                    break;
                }
                cursor = self
                    .inodes
                    .get(&dir.ino())
                    .and_then(|i| i.parent.as_ref().map(|(d, _)| *d));
            }
        }
        out
    }

    /// Asserts that the registered bound set matches `expected`. A mismatch
    /// means the cache and the protocol disagree about the shape of the
    /// region being migrated; the journal is the source of truth on restart.
    pub fn verify_subtree_bounds(&self, root: DirId, expected: &BTreeSet<DirId>) {
        let actual = self.get_subtree_bounds(root);
        assert_eq!(
            actual, *expected,
            "subtree bounds mismatch for {root}: cache {actual:?} vs protocol {expected:?}"
        );
    }

    /// The nearest ancestor subtree root strictly above `dir`.
    #[must_use]
    pub fn containing_subtree_above(&self, dir: DirId) -> Option<DirId> {
        let mut cursor = self
            .inodes
            .get(&dir.ino())
            .and_then(|i| i.parent.as_ref().map(|(d, _)| *d));
        while let Some(current) = cursor {
            if self.subtrees.contains_key(&current) {
                return Some(current);
            }
            cursor = self
                .inodes
                .get(&current.ino())
                .and_then(|i| i.parent.as_ref().map(|(d, _)| *d));
        }
        None
    }

    // -- ambiguous imports --------------------------------------------------

    /// Records a subtree whose import cannot be resolved locally; the
    /// cluster-wide import-map exchange disambiguates it.
    pub fn add_ambiguous_import(&mut self, root: DirId, bounds: impl IntoIterator<Item = DirId>) {
        tracing::warn!(rank = %self.rank, %root, "registering ambiguous import");
        self.ambiguous_imports
            .insert(root, bounds.into_iter().collect());
        self.pending_import_maps = true;
    }

    #[must_use]
    pub fn has_ambiguous_import(&self, root: DirId) -> bool {
        self.ambiguous_imports.contains_key(&root)
    }

    // -- discover / trace ---------------------------------------------------

    /// Builds the spanning context for one bound: the trace of dentry steps
    /// from `root` down to the bound, plus discover records for every
    /// intermediate directory.
    ///
    /// Returns `None` if the bound does not hang below `root` in cache —
    /// a protocol error the caller turns fatal.
    #[must_use]
    pub fn trace_to_bound(&self, root: DirId, bound: DirId) -> Option<BoundTrace> {
        let mut steps = Vec::new();
        let mut dirs = Vec::new();
        let mut cursor = bound.ino();
        loop {
            let inode = self.inodes.get(&cursor)?;
            let (parent_dir, name) = inode.parent.as_ref()?;
            steps.push(TraceStep {
                dir: *parent_dir,
                dentry: name.clone(),
                ino: cursor,
            });
            if *parent_dir == root {
                break;
            }
            dirs.push(DirDiscover {
                dir: *parent_dir,
                ino: parent_dir.ino(),
            });
            cursor = parent_dir.ino();
        }
        steps.reverse();
        dirs.reverse();
        Some(BoundTrace {
            bound,
            steps,
            dirs,
        })
    }

    /// Instantiates the inode (and, for directories, nothing more) named by
    /// a discover record, as a replica. No-op when already in cache.
    pub fn resolve_discover(&mut self, discover: DirDiscover) {
        if !self.inodes.contains_key(&discover.ino) {
            self.insert_inode(Inode::new_replica(discover.ino, InodeKind::Dir, None));
        }
    }

    /// Instantiates a trace step: ensures the dentry exists in its directory
    /// and the inode it names is in cache.
    pub fn resolve_trace_step(&mut self, step: &TraceStep) {
        if !self.inodes.contains_key(&step.ino) {
            self.insert_inode(Inode::new_replica(
                step.ino,
                InodeKind::Dir,
                Some((step.dir, step.dentry.clone())),
            ));
        }
        if let Some(dir) = self.dirs.get_mut(&step.dir) {
            dir.entries
                .entry(step.dentry.clone())
                .or_insert_with(|| Dentry::new(DentryLink::Primary(step.ino), false));
        }
    }

    /// Opens a directory whose inode we hold but whose dirfrag we do not.
    /// Returns `true` when the directory is already open; otherwise the open
    /// completes later through [`CacheCompletion::RemoteDirOpened`].
    pub fn open_remote_dir(&mut self, ino: InodeId) -> bool {
        let id = DirId::from(ino);
        if self.dirs.contains_key(&id) {
            return true;
        }
        self.insert_dir(Dir::new(id, false));
        self.completions.push(CacheCompletion::RemoteDirOpened(id));
        false
    }

    /// Fetches a directory's missing entries. Completion is delivered
    /// through [`CacheCompletion::DirFetched`].
    pub fn fetch_dir(&mut self, id: DirId) {
        if let Some(dir) = self.dirs.get_mut(&id) {
            dir.complete = true;
            self.completions.push(CacheCompletion::DirFetched(id));
        }
    }

    /// Trims a directory frag from cache. The inode stays; a later
    /// [`Self::open_remote_dir`] brings the frag back. Pinned frags must not
    /// be trimmed.
    pub fn evict_dir(&mut self, id: DirId) {
        if let Some(dir) = self.dirs.get(&id) {
            debug_assert!(
                dir.auth_pins == 0 && !dir.export_bound_pin && !dir.import_bound_pin,
                "evicting pinned {id}"
            );
        }
        self.dirs.remove(&id);
    }

    // -- delayed expires ----------------------------------------------------

    /// Queues a cache-expire from `from` that arrived while `root` was mid-
    /// migration.
    pub fn delay_expire(&mut self, root: DirId, from: MdsId) {
        self.delayed_expires.entry(root).or_default().push(from);
    }

    /// Processes expires delayed during a migration that reversed: we are
    /// still the authority, so they apply now.
    pub fn process_delayed_expire(&mut self, root: DirId) {
        if let Some(delayed) = self.delayed_expires.remove(&root) {
            for from in delayed {
                tracing::debug!(rank = %self.rank, %root, %from, "processing delayed expire");
                if let Some(dir) = self.dirs.get_mut(&root) {
                    dir.replicas.remove(&from);
                }
            }
        }
    }

    /// Drops expires delayed during a migration that committed: the new
    /// authority owns replica tracking now.
    pub fn discard_delayed_expire(&mut self, root: DirId) {
        self.delayed_expires.remove(&root);
    }

    #[must_use]
    pub fn delayed_expire_count(&self, root: DirId) -> usize {
        self.delayed_expires.get(&root).map_or(0, Vec::len)
    }

    // -- import-map gossip --------------------------------------------------

    /// Marks that our subtree map changed in a way peers must learn about.
    pub fn note_pending_import_maps(&mut self) {
        self.pending_import_maps = true;
    }

    #[must_use]
    pub fn has_pending_import_maps(&self) -> bool {
        self.pending_import_maps
    }

    /// Flushes the pending import-map gossip (the exchange itself is owned
    /// by the resolver, not the cache).
    pub fn send_pending_import_maps(&mut self) {
        if self.pending_import_maps {
            tracing::debug!(rank = %self.rank, "sending pending import maps");
            self.pending_import_maps = false;
        }
    }

    // -- queries used by the migrator --------------------------------------

    /// The primary parent linkage of a directory's inode.
    #[must_use]
    pub fn parent_of(&self, root: DirId) -> Option<(DirId, String)> {
        self.inodes.get(&root.ino()).and_then(|i| i.parent.clone())
    }

    /// Whether the inode backing `root`'s parent directory is authoritative
    /// here. `None` if the parent is unknown.
    #[must_use]
    pub fn parent_inode_is_auth(&self, root: DirId) -> Option<bool> {
        let (parent_dir, _) = self.parent_of(root)?;
        self.inodes.get(&parent_dir.ino()).map(|i| i.auth)
    }

    /// Authority of the subtree containing `dir` (walking up through
    /// ancestor subtree roots if `dir` is not itself one).
    #[must_use]
    pub fn authority_of(&self, dir: DirId) -> Option<Authority> {
        if let Some(info) = self.subtrees.get(&dir) {
            return Some(info.auth);
        }
        self.containing_subtree_above(dir)
            .and_then(|root| self.subtrees.get(&root).map(|s| s.auth))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
