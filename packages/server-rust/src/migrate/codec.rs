//! Subtree codec: cache region ⇄ wire records.
//!
//! `encode_subtree` walks the region from the root, stopping at bounds, and
//! emits the bulk records while applying the exporter-side transitions to
//! the cache (lock export targets, capability stale-out, replica nonce).
//! `decode_subtree` is the strict inverse; it is shared by the importer's
//! ingestion and by the exporter's reversal of a failed export, which decodes
//! its own buffered payload straight back. `strip_imported_region` is the
//! importer's reverse walk for an import that never committed.

use std::collections::BTreeSet;
use std::collections::VecDeque;

use grove_core::{
    CapMessage, DentryPayload, DentryRecord, DirId, DirRecord, ExportPayload, InodeKind,
    InodeRecord, MdsId, EXPORT_NONCE,
};

use crate::cache::{Dentry, DentryLink, Dir, Inode, MetaCache};

/// Directories of the region in walk order: root first, bounds excluded.
fn region_dirs(cache: &MetaCache, root: DirId, bounds: &BTreeSet<DirId>) -> Vec<DirId> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        let Some(dir) = cache.dir(id) else { continue };
        out.push(id);
        for dentry in dir.entries.values() {
            if let DentryLink::Primary(ino) = dentry.link {
                let child = DirId::from(ino);
                let is_dir = cache
                    .inode(ino)
                    .is_some_and(|i| i.kind == InodeKind::Dir);
                if is_dir && cache.has_dir(child) && !bounds.contains(&child) {
                    queue.push_back(child);
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encodes the region rooted at `root` and applies the export transitions to
/// the local cache. Returns the payload and the `Stale` messages owed to
/// every client holding caps on an exported inode.
pub fn encode_subtree(
    cache: &mut MetaCache,
    root: DirId,
    bounds: &BTreeSet<DirId>,
) -> (ExportPayload, Vec<CapMessage>) {
    let mut cap_msgs = Vec::new();
    let mut dirs = Vec::new();

    for dir_id in region_dirs(cache, root, bounds) {
        let dir = cache.dir(dir_id).expect("region walk returned live dirs");
        let replicas: Vec<_> = dir.replicas.iter().map(|(&m, &n)| (m, n)).collect();
        let names: Vec<String> = dir.entries.keys().cloned().collect();

        let mut dentries = Vec::with_capacity(names.len());
        for name in names {
            let dentry = cache
                .dir(dir_id)
                .and_then(|d| d.entries.get(&name))
                .expect("dentry present during walk");
            let dentry_replicas: Vec<_> =
                dentry.replicas.iter().map(|(&m, &n)| (m, n)).collect();
            let payload = match dentry.link {
                DentryLink::Null => DentryPayload::N,
                DentryLink::Remote(ino) => DentryPayload::L { ino },
                DentryLink::Primary(ino) => {
                    let record = export_inode(cache, ino, &mut cap_msgs);
                    DentryPayload::I { inode: record }
                }
            };
            dentries.push(DentryRecord {
                name,
                replicas: dentry_replicas,
                payload,
            });
        }

        dirs.push(DirRecord {
            dir: dir_id,
            replicas,
            dentries,
        });
    }

    (ExportPayload { root, dirs }, cap_msgs)
}

/// Applies the export transition to one primary inode and records it.
fn export_inode(cache: &mut MetaCache, ino: grove_core::InodeId, cap_msgs: &mut Vec<CapMessage>) -> InodeRecord {
    let inode = cache.inode_mut(ino).expect("primary dentry names a cached inode");

    inode.hard.export();
    inode.file.export();

    // Clients reissue against the new authority.
    for cap in &inode.caps {
        cap_msgs.push(CapMessage::Stale {
            client: cap.client,
            ino,
        });
    }
    let caps = std::mem::take(&mut inode.caps);

    inode.cached_by.clear();
    inode.dirty = false;
    inode.auth = false;
    inode.replica_nonce = EXPORT_NONCE;

    InodeRecord {
        ino,
        kind: inode.kind,
        hard: inode.hard.clone(),
        file: inode.file.clone(),
        caps,
        replica_nonce: EXPORT_NONCE,
    }
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Integrates a bulk payload: the strict inverse of [`encode_subtree`].
///
/// Every decoded entity is marked authoritative here, `old_auth` is added to
/// its replica tracking at the export nonce, and this rank is removed from
/// any replica list it appears in. Returns the `Reap` messages owed to every
/// client whose caps rode along.
pub fn decode_subtree(
    cache: &mut MetaCache,
    payload: &ExportPayload,
    old_auth: MdsId,
) -> Vec<CapMessage> {
    let rank = cache.rank();
    let mut cap_msgs = Vec::new();

    for dir_record in &payload.dirs {
        if !cache.has_dir(dir_record.dir) {
            cache.insert_dir(Dir::new(dir_record.dir, true));
        }
        {
            let dir = cache.dir_mut(dir_record.dir).expect("just ensured");
            dir.auth = true;
            dir.replicas = dir_record
                .replicas
                .iter()
                .copied()
                .filter(|(m, _)| *m != rank)
                .collect();
            dir.replicas.insert(old_auth, EXPORT_NONCE);
        }

        for dentry_record in &dir_record.dentries {
            let link = match &dentry_record.payload {
                DentryPayload::N => DentryLink::Null,
                DentryPayload::L { ino } => DentryLink::Remote(*ino),
                DentryPayload::I { inode } => {
                    import_inode(cache, dir_record.dir, &dentry_record.name, inode, old_auth);
                    for cap in &inode.caps {
                        cap_msgs.push(CapMessage::Reap {
                            client: cap.client,
                            ino: inode.ino,
                            old_auth,
                        });
                    }
                    DentryLink::Primary(inode.ino)
                }
            };

            let dir = cache.dir_mut(dir_record.dir).expect("dir ensured above");
            let dentry = dir
                .entries
                .entry(dentry_record.name.clone())
                .or_insert_with(|| Dentry::new(link, true));
            dentry.link = link;
            dentry.auth = true;
            dentry.replicas = dentry_record
                .replicas
                .iter()
                .copied()
                .filter(|(m, _)| *m != rank)
                .collect();
            dentry.replicas.insert(old_auth, EXPORT_NONCE);
        }
    }

    cap_msgs
}

/// Integrates one primary inode record.
fn import_inode(
    cache: &mut MetaCache,
    dir: DirId,
    name: &str,
    record: &InodeRecord,
    old_auth: MdsId,
) {
    let rank = cache.rank();
    if cache.inode(record.ino).is_none() {
        cache.insert_inode(Inode::new_replica(
            record.ino,
            record.kind,
            Some((dir, name.to_string())),
        ));
    }
    let inode = cache.inode_mut(record.ino).expect("just ensured");

    // A pre-existing replica may carry a gather referencing the old
    // authority or ourselves; both leave the picture now.
    if inode.hard.remove_from_gather(&[old_auth, rank]) {
        tracing::debug!(ino = %record.ino, "hard lock settled on import");
    }
    if inode.file.remove_from_gather(&[old_auth, rank]) {
        tracing::debug!(ino = %record.ino, "file lock settled on import");
    }

    inode.parent = Some((dir, name.to_string()));
    inode.auth = true;
    inode.dirty = false;
    inode.hard = record.hard.clone();
    inode.file = record.file.clone();
    inode.caps = record.caps.clone();
    inode.cached_by.clear();
    inode.cached_by.insert(old_auth, EXPORT_NONCE);
    inode.cached_by.remove(&rank);
    inode.replica_nonce = record.replica_nonce;
}

// ---------------------------------------------------------------------------
// Reverse walk (importer)
// ---------------------------------------------------------------------------

/// Walks the imported region clearing everything the decode asserted: auth
/// bits on directories, dentries, and inodes, dirty state, lock gathers, and
/// capability tables, stopping at bounds. Used when an import unwinds before
/// commit.
pub fn strip_imported_region(cache: &mut MetaCache, root: DirId, bounds: &BTreeSet<DirId>) {
    for dir_id in region_dirs(cache, root, bounds) {
        let names: Vec<String> = cache
            .dir(dir_id)
            .map(|d| d.entries.keys().cloned().collect())
            .unwrap_or_default();

        for name in &names {
            let link = cache
                .dir(dir_id)
                .and_then(|d| d.entries.get(name))
                .map(|d| d.link);
            if let Some(DentryLink::Primary(ino)) = link {
                if let Some(inode) = cache.inode_mut(ino) {
                    inode.auth = false;
                    inode.dirty = false;
                    inode.hard.gather.clear();
                    inode.file.gather.clear();
                    inode.caps.clear();
                }
            }
            if let Some(dentry) = cache
                .dir_mut(dir_id)
                .and_then(|d| d.entries.get_mut(name))
            {
                dentry.auth = false;
                dentry.dirty = false;
            }
        }

        let dir = cache.dir_mut(dir_id).expect("region walk returned live dirs");
        dir.auth = false;
        dir.dirty = false;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use grove_core::{
        cap_bits, Capability, ClientId, FileLock, HardLock, InodeId, LockState, MdsId,
        ReplicaNonce,
    };

    use super::*;

    /// Exporter-side region: dir `b (0x10)` containing file `f (0x20)` with
    /// one client cap and a gathering file lock, plus a null entry and a
    /// remote link.
    fn exporter_cache() -> MetaCache {
        let mut cache = MetaCache::new(MdsId(0));
        cache.insert_inode(Inode::new_auth(InodeId(0x10), InodeKind::Dir, None));
        let mut dir = Dir::new(DirId(0x10), true);
        dir.replicas.insert(MdsId(1), ReplicaNonce(4));
        dir.replicas.insert(MdsId(2), ReplicaNonce(7));

        let mut file = Inode::new_auth(
            InodeId(0x20),
            InodeKind::File,
            Some((DirId(0x10), "f".to_string())),
        );
        file.file = LockState::gathering(FileLock::GatherSyncMixed, [MdsId(2)]);
        file.hard = LockState::gathering(HardLock::GatherRead, [MdsId(2)]);
        file.caps.push(Capability::new(ClientId(77), cap_bits::READ));
        file.dirty = true;
        file.cached_by.insert(MdsId(2), ReplicaNonce(7));
        cache.insert_inode(file);

        dir.entries.insert(
            "f".to_string(),
            Dentry::new(DentryLink::Primary(InodeId(0x20)), true),
        );
        dir.entries
            .insert("gone".to_string(), Dentry::new(DentryLink::Null, true));
        dir.entries.insert(
            "ln".to_string(),
            Dentry::new(DentryLink::Remote(InodeId(0x99)), true),
        );
        cache.insert_dir(dir);
        cache
    }

    #[test]
    fn encode_applies_lock_transitions_and_stales_caps() {
        let mut cache = exporter_cache();
        let (payload, stales) = encode_subtree(&mut cache, DirId(0x10), &BTreeSet::new());

        assert_eq!(payload.root, DirId(0x10));
        assert_eq!(payload.dirs.len(), 1);
        assert_eq!(payload.dirs[0].dentries.len(), 3);

        // The gathering locks collapsed to their export targets.
        let record = payload.dirs[0]
            .dentries
            .iter()
            .find_map(|d| match &d.payload {
                DentryPayload::I { inode } => Some(inode),
                _ => None,
            })
            .expect("primary record");
        assert_eq!(record.file.state, FileLock::Mixed);
        assert!(record.file.gather.is_empty());
        assert_eq!(record.hard.state, HardLock::Lock);
        assert_eq!(record.replica_nonce, EXPORT_NONCE);
        assert_eq!(record.caps.len(), 1);

        // One stale per cap.
        assert_eq!(
            stales,
            vec![CapMessage::Stale {
                client: ClientId(77),
                ino: InodeId(0x20),
            }]
        );

        // The local inode was stripped: no auth, no caps, no replicas, clean.
        let inode = cache.inode(InodeId(0x20)).unwrap();
        assert!(!inode.auth);
        assert!(!inode.dirty);
        assert!(inode.caps.is_empty());
        assert!(inode.cached_by.is_empty());
        assert_eq!(inode.replica_nonce, EXPORT_NONCE);
    }

    #[test]
    fn decode_is_the_inverse_modulo_known_deltas() {
        let mut exporter = exporter_cache();
        let (payload, _) = encode_subtree(&mut exporter, DirId(0x10), &BTreeSet::new());

        let mut importer = MetaCache::new(MdsId(1));
        importer.insert_inode(Inode::new_replica(InodeId(0x10), InodeKind::Dir, None));
        importer.insert_dir(Dir::new(DirId(0x10), false));
        let reaps = decode_subtree(&mut importer, &payload, MdsId(0));

        // Caps reappear with a reap naming the old authority.
        assert_eq!(
            reaps,
            vec![CapMessage::Reap {
                client: ClientId(77),
                ino: InodeId(0x20),
                old_auth: MdsId(0),
            }]
        );

        let dir = importer.dir(DirId(0x10)).unwrap();
        assert!(dir.auth);
        // Known replica deltas: self removed, old auth added at EXPORT nonce.
        assert!(!dir.replicas.contains_key(&MdsId(1)));
        assert_eq!(dir.replicas.get(&MdsId(0)), Some(&EXPORT_NONCE));
        assert_eq!(dir.replicas.get(&MdsId(2)), Some(&ReplicaNonce(7)));
        assert_eq!(dir.entries.len(), 3);
        assert_eq!(dir.entries["gone"].link, DentryLink::Null);
        assert_eq!(dir.entries["ln"].link, DentryLink::Remote(InodeId(0x99)));

        let inode = importer.inode(InodeId(0x20)).unwrap();
        assert!(inode.auth);
        assert!(!inode.dirty);
        assert_eq!(inode.file.state, FileLock::Mixed);
        assert_eq!(inode.caps.len(), 1);
        assert_eq!(inode.cached_by.get(&MdsId(0)), Some(&EXPORT_NONCE));
    }

    #[test]
    fn decode_own_payload_restores_exporter_authority() {
        // The reverse path: encode, then decode the buffer locally as if the
        // importer had died mid-window.
        let mut cache = exporter_cache();
        let (payload, _) = encode_subtree(&mut cache, DirId(0x10), &BTreeSet::new());
        assert!(!cache.inode(InodeId(0x20)).unwrap().auth);

        let _ = decode_subtree(&mut cache, &payload, MdsId(1));
        let inode = cache.inode(InodeId(0x20)).unwrap();
        assert!(inode.auth);
        assert_eq!(inode.caps.len(), 1, "caps restored from the buffer");
        assert!(cache.dir(DirId(0x10)).unwrap().auth);
    }

    #[test]
    fn strip_clears_everything_the_decode_asserted() {
        let mut exporter = exporter_cache();
        let (payload, _) = encode_subtree(&mut exporter, DirId(0x10), &BTreeSet::new());

        let mut importer = MetaCache::new(MdsId(1));
        importer.insert_inode(Inode::new_replica(InodeId(0x10), InodeKind::Dir, None));
        importer.insert_dir(Dir::new(DirId(0x10), false));
        decode_subtree(&mut importer, &payload, MdsId(0));

        strip_imported_region(&mut importer, DirId(0x10), &BTreeSet::new());

        let dir = importer.dir(DirId(0x10)).unwrap();
        assert!(!dir.auth);
        assert!(dir.entries.values().all(|d| !d.auth));
        let inode = importer.inode(InodeId(0x20)).unwrap();
        assert!(!inode.auth);
        assert!(inode.caps.is_empty());
        assert!(inode.hard.gather.is_empty() && inode.file.gather.is_empty());
    }

    #[test]
    fn bounds_terminate_the_walk() {
        // b (0x10) contains sub-dir c (0x30) which is a bound: c's contents
        // must not be encoded.
        let mut cache = exporter_cache();
        cache.insert_inode(Inode::new_auth(
            InodeId(0x30),
            InodeKind::Dir,
            Some((DirId(0x10), "c".to_string())),
        ));
        cache.insert_dir(Dir::new(DirId(0x30), false));
        cache
            .dir_mut(DirId(0x10))
            .unwrap()
            .entries
            .insert("c".to_string(), Dentry::new(DentryLink::Primary(InodeId(0x30)), true));

        let bounds: BTreeSet<DirId> = [DirId(0x30)].into_iter().collect();
        let (payload, _) = encode_subtree(&mut cache, DirId(0x10), &bounds);
        assert_eq!(payload.dirs.len(), 1, "bound dir excluded from bulk");
        // The dentry leading to the bound still rides along (the importer
        // links the bound through the prep trace).
        assert!(payload.dirs[0].dentries.iter().any(|d| d.name == "c"));
    }
}
