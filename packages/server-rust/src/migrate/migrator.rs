//! The Migrator: export and import state machines and bystander handling.
//!
//! One Migrator lives on each MDS, owned by the node task. It is reachable
//! only through [`Migrator::dispatch`] and the single local entry point
//! [`Migrator::export_subtree`]; continuations (freeze completion, journal
//! durability, directory fetches) re-enter through their own methods and
//! re-check that the record they closed over still exists in the expected
//! phase — if not, the failure handler already unwound it and the
//! continuation returns silently.
//!
//! Phase discipline: an ack that arrives for a subtree we are no longer
//! migrating in the matching phase is discarded with a log line. That is the
//! normal consequence of peer failure racing with the ack, never an error.
//! A message that contradicts frozen-subtree expectations is fatal — the
//! journal is the source of truth on restart.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use grove_core::{
    Authority, CapMessage, DirDiscover, DirId, ExportPayload, InodeId, MdsId, ROOT_INO,
};

use crate::balancer::Balancer;
use crate::cache::MetaCache;
use crate::journal::{Journal, JournalEvent};
use crate::mdsmap::MdsMap;

use super::codec;
use super::messages::{
    ExportAckPayload, ExportDiscoverAckPayload, ExportDiscoverPayload, ExportFinishPayload,
    ExportNotifyAckPayload, ExportNotifyPayload, ExportPayloadMsg, ExportPrepAckPayload,
    ExportPrepPayload, MigrationMessage,
};
use super::types::{
    ExportPhase, ExportRecord, ExportState, ImportPhase, ImportRecord, ImportState,
};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Collaborators handed to the Migrator for the duration of one handler.
///
/// The node task owns all of these; the Migrator never keeps a reference
/// across a suspension. Outgoing messages are staged in `outbox` and flushed
/// by the node after the handler returns.
pub struct MigratorCtx<'a> {
    pub cache: &'a mut MetaCache,
    pub journal: &'a mut Journal,
    pub balancer: &'a mut Balancer,
    pub mdsmap: Arc<MdsMap>,
    pub outbox: &'a mut Vec<(MdsId, MigrationMessage)>,
    pub client_outbox: &'a mut Vec<CapMessage>,
}

impl MigratorCtx<'_> {
    fn send(&mut self, to: MdsId, msg: MigrationMessage) {
        self.outbox.push((to, msg));
    }
}

/// Continuation key for a journal entry in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoggedKind {
    /// Exporter's `Export` event: durable → second notify round.
    ExportCommit,
    /// Importer's `ImportStart` event: durable → `EXPORT-ACK`.
    ImportStart,
}

// ---------------------------------------------------------------------------
// Migrator
// ---------------------------------------------------------------------------

/// Per-MDS subtree migration driver.
pub struct Migrator {
    rank: MdsId,
    exports: HashMap<DirId, ExportRecord>,
    imports: HashMap<InodeId, ImportRecord>,
    /// Journal sequence number → the continuation it resolves.
    logged: HashMap<u64, (DirId, LoggedKind)>,
}

impl Migrator {
    #[must_use]
    pub fn new(rank: MdsId) -> Self {
        Self {
            rank,
            exports: HashMap::new(),
            imports: HashMap::new(),
            logged: HashMap::new(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> MdsId {
        self.rank
    }

    // -- queries ------------------------------------------------------------

    #[must_use]
    pub fn export_phase(&self, root: DirId) -> Option<ExportPhase> {
        self.exports.get(&root).map(ExportRecord::phase)
    }

    #[must_use]
    pub fn import_phase(&self, ino: InodeId) -> Option<ImportPhase> {
        self.imports.get(&ino).map(ImportRecord::phase)
    }

    #[must_use]
    pub fn export_count(&self) -> usize {
        self.exports.len()
    }

    /// Roots with an export in flight.
    #[must_use]
    pub fn export_roots(&self) -> Vec<DirId> {
        self.exports.keys().copied().collect()
    }

    /// Root inodes with an import in flight.
    #[must_use]
    pub fn import_inos(&self) -> Vec<InodeId> {
        self.imports.keys().copied().collect()
    }

    #[must_use]
    pub fn import_count(&self) -> usize {
        self.imports.len()
    }

    /// Queues a continuation resolved at the export's termination: `true`
    /// when the subtree migrated, `false` on unwind. Resolved immediately if
    /// no export is in flight for `root`.
    pub fn add_finish_waiter(&mut self, root: DirId) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        match self.exports.get_mut(&root) {
            Some(record) => record.finish_waiters.push(tx),
            None => {
                let _ = tx.send(false);
            }
        }
        rx
    }

    pub(super) fn exports_mut(&mut self) -> &mut HashMap<DirId, ExportRecord> {
        &mut self.exports
    }

    pub(super) fn imports_mut(&mut self) -> &mut HashMap<InodeId, ImportRecord> {
        &mut self.imports
    }

    // -- dispatch -----------------------------------------------------------

    /// Routes one protocol message to its handler.
    pub fn dispatch(&mut self, ctx: &mut MigratorCtx<'_>, from: MdsId, msg: MigrationMessage) {
        tracing::debug!(rank = %self.rank, %from, kind = msg.kind(), root = %msg.root(), "dispatch");
        match msg {
            // import side
            MigrationMessage::ExportDiscover(p) => self.handle_export_discover(ctx, from, p),
            MigrationMessage::ExportPrep(p) => self.handle_export_prep(ctx, from, p),
            MigrationMessage::Export(p) => self.handle_export(ctx, from, p),
            MigrationMessage::ExportFinish(p) => self.handle_export_finish(ctx, from, p),

            // export side
            MigrationMessage::ExportDiscoverAck(p) => {
                self.handle_export_discover_ack(ctx, from, p);
            }
            MigrationMessage::ExportPrepAck(p) => self.handle_export_prep_ack(ctx, from, p),
            MigrationMessage::ExportAck(p) => self.handle_export_ack(ctx, from, p),
            MigrationMessage::ExportNotifyAck(p) => self.handle_export_notify_ack(ctx, from, p),

            // third party (authority adjustments)
            MigrationMessage::ExportNotify(p) => self.handle_export_notify(ctx, from, p),
        }
    }

    // =======================================================================
    // Exporter side
    // =======================================================================

    /// Begins exporting the subtree rooted at `root` to `dest`.
    ///
    /// Precondition violations are silent no-ops: the balancer retries on
    /// its next tick, and a subtree that cannot migrate right now is not an
    /// error condition.
    pub fn export_subtree(&mut self, ctx: &mut MigratorCtx<'_>, root: DirId, dest: MdsId) {
        if dest == self.rank {
            return;
        }
        if root.ino() == ROOT_INO {
            return;
        }
        let Some(dir) = ctx.cache.dir(root) else {
            return;
        };
        if !dir.auth || dir.hashed || dir.is_freezing() || dir.is_frozen() {
            return;
        }
        if ctx.mdsmap.is_degraded() || !ctx.mdsmap.is_active(dest) {
            return;
        }
        if self.exports.contains_key(&root) || self.imports.contains_key(&root.ino()) {
            return;
        }
        if !ctx.cache.path_pin(root) {
            return;
        }

        tracing::info!(rank = %self.rank, %root, %dest, "exporting subtree");
        metrics::counter!("grove_migrator_exports_started").increment(1);

        // The auth-pin keeps the freeze from completing before the peer
        // accepts the discover.
        ctx.cache.auth_pin(root);
        ctx.cache.freeze_tree(root);

        self.exports.insert(root, ExportRecord::new(dest));
        ctx.send(
            dest,
            MigrationMessage::ExportDiscover(ExportDiscoverPayload {
                root,
                discover: DirDiscover {
                    dir: root,
                    ino: root.ino(),
                },
            }),
        );
    }

    fn handle_export_discover_ack(
        &mut self,
        ctx: &mut MigratorCtx<'_>,
        from: MdsId,
        p: ExportDiscoverAckPayload,
    ) {
        let Some(record) = self.exports.get_mut(&p.root) else {
            tracing::debug!(rank = %self.rank, root = %p.root, "discover-ack for unknown export, dropping");
            return;
        };
        if record.peer != from || record.phase() != ExportPhase::Discovering {
            tracing::debug!(rank = %self.rank, root = %p.root, phase = ?record.phase(), "discover-ack out of phase, dropping");
            return;
        }

        record.state = ExportState::Freezing;
        // Releasing the auth-pin lets the freeze complete; with no other
        // pins the completion is queued immediately.
        ctx.cache.auth_unpin(p.root);
    }

    /// Freeze completion continuation.
    pub fn subtree_frozen(&mut self, ctx: &mut MigratorCtx<'_>, root: DirId) {
        let Some(record) = self.exports.get_mut(&root) else {
            // Unwound while the freeze drained.
            return;
        };
        if record.phase() != ExportPhase::Freezing {
            return;
        }
        let peer = record.peer;

        let bounds = ctx.cache.get_subtree_bounds(root);
        for bound in &bounds {
            ctx.cache.pin_export_bound(*bound);
        }

        // Bystanders: every replica of the root other than the destination
        // that is still participating in the replica protocol.
        let bystanders: BTreeSet<MdsId> = ctx
            .cache
            .dir(root)
            .map(|d| {
                d.replicas
                    .keys()
                    .copied()
                    .filter(|m| *m != peer && ctx.mdsmap.is_active_or_stopping(*m))
                    .collect()
            })
            .unwrap_or_default();

        let traces = bounds
            .iter()
            .map(|bound| {
                ctx.cache
                    .trace_to_bound(root, *bound)
                    .unwrap_or_else(|| panic!("bound {bound} does not hang below {root}"))
            })
            .collect();

        let prep = ExportPrepPayload {
            root,
            root_discover: DirDiscover {
                dir: root,
                ino: root.ino(),
            },
            bound_inos: bounds.iter().map(|b| b.ino()).collect(),
            traces,
            bystanders: bystanders.iter().copied().collect(),
        };

        let record = self.exports.get_mut(&root).expect("checked above");
        record.state = ExportState::Prepping {
            bounds,
            bystanders,
        };
        ctx.send(peer, MigrationMessage::ExportPrep(prep));
    }

    fn handle_export_prep_ack(
        &mut self,
        ctx: &mut MigratorCtx<'_>,
        from: MdsId,
        p: ExportPrepAckPayload,
    ) {
        let Some(record) = self.exports.get_mut(&p.root) else {
            tracing::debug!(rank = %self.rank, root = %p.root, "prep-ack for unknown export, dropping");
            return;
        };
        if record.peer != from {
            return;
        }
        let ExportState::Prepping { bounds, bystanders } = &record.state else {
            tracing::debug!(rank = %self.rank, root = %p.root, phase = ?record.phase(), "prep-ack out of phase, dropping");
            return;
        };
        let (bounds, bystanders) = (bounds.clone(), bystanders.clone());
        let peer = record.peer;

        // First notify round: authority will change from (us) to (us, dest).
        let was = Authority::sole(self.rank);
        let now = Authority::ambiguous(self.rank, peer);
        for bystander in &bystanders {
            ctx.send(
                *bystander,
                MigrationMessage::ExportNotify(ExportNotifyPayload {
                    root: p.root,
                    was,
                    now,
                    bounds: bounds.iter().copied().collect(),
                }),
            );
        }

        record.state = ExportState::Warning {
            bounds,
            bystanders: bystanders.clone(),
            warning_acks_pending: bystanders,
        };
        self.maybe_export_go(ctx, p.root);
    }

    /// Sends the bulk payload once every warning ack is in.
    pub(super) fn maybe_export_go(&mut self, ctx: &mut MigratorCtx<'_>, root: DirId) {
        let Some(record) = self.exports.get_mut(&root) else {
            return;
        };
        let ExportState::Warning {
            bounds,
            bystanders,
            warning_acks_pending,
        } = &record.state
        else {
            return;
        };
        if !warning_acks_pending.is_empty() {
            return;
        }
        let (bounds, bystanders) = (bounds.clone(), bystanders.clone());
        let peer = record.peer;

        assert!(
            ctx.cache.dir(root).is_some_and(|d| d.is_frozen()),
            "exporting {root} while not frozen"
        );

        // The subtree's load leaves our books, and in-flight reads still
        // resolve through the ambiguous pair until the importer acks.
        ctx.balancer.subtract_export(root);
        ctx.cache
            .adjust_subtree_auth(root, Authority::ambiguous(self.rank, peer));

        let (payload, stales) = codec::encode_subtree(ctx.cache, root, &bounds);
        ctx.client_outbox.extend(stales);
        let data = payload.to_bytes().expect("subtree payload encodes");

        let record = self.exports.get_mut(&root).expect("checked above");
        record.state = ExportState::Exporting {
            bounds,
            bystanders,
            encoded: Bytes::from(data.clone()),
        };
        ctx.send(
            peer,
            MigrationMessage::Export(ExportPayloadMsg { root, data }),
        );
    }

    fn handle_export_ack(&mut self, ctx: &mut MigratorCtx<'_>, from: MdsId, p: ExportAckPayload) {
        let Some(record) = self.exports.get_mut(&p.root) else {
            tracing::debug!(rank = %self.rank, root = %p.root, "export-ack for unknown export, dropping");
            return;
        };
        if record.peer != from {
            return;
        }
        let ExportState::Exporting {
            bounds, bystanders, ..
        } = &record.state
        else {
            tracing::debug!(rank = %self.rank, root = %p.root, phase = ?record.phase(), "export-ack out of phase, dropping");
            return;
        };
        let (bounds, bystanders) = (bounds.clone(), bystanders.clone());

        // The buffered payload is dropped here: the importer holds the data
        // durably enough that reversal is no longer ours to do.
        let seq = ctx.journal.submit_entry(JournalEvent::Export {
            root: p.root,
            bounds: bounds.iter().copied().collect(),
        });
        self.logged.insert(seq, (p.root, LoggedKind::ExportCommit));

        let record = self.exports.get_mut(&p.root).expect("checked above");
        record.state = ExportState::LoggingFinish { bounds, bystanders };
    }

    /// Journal durability continuation for both roles.
    pub fn journal_durable(&mut self, ctx: &mut MigratorCtx<'_>, seq: u64) {
        let Some((root, kind)) = self.logged.remove(&seq) else {
            // ImportFinish events carry no continuation; unwound records
            // leave theirs behind too.
            return;
        };
        match kind {
            LoggedKind::ExportCommit => self.export_logged_finish(ctx, root),
            LoggedKind::ImportStart => self.import_logged_start(ctx, root),
        }
    }

    /// `Export` event durable: run the second notify round.
    fn export_logged_finish(&mut self, ctx: &mut MigratorCtx<'_>, root: DirId) {
        let Some(record) = self.exports.get_mut(&root) else {
            return;
        };
        let ExportState::LoggingFinish { bounds, bystanders } = &record.state else {
            return;
        };
        let (bounds, bystanders) = (bounds.clone(), bystanders.clone());
        let peer = record.peer;

        let was = Authority::ambiguous(self.rank, peer);
        let now = Authority::sole(peer);
        for bystander in &bystanders {
            ctx.send(
                *bystander,
                MigrationMessage::ExportNotify(ExportNotifyPayload {
                    root,
                    was,
                    now,
                    bounds: bounds.iter().copied().collect(),
                }),
            );
        }

        record.state = ExportState::Notifying {
            bounds,
            notify_acks_pending: bystanders,
        };
        self.maybe_export_finish(ctx, root);
    }

    /// Terminal once every notify ack is in.
    pub(super) fn maybe_export_finish(&mut self, ctx: &mut MigratorCtx<'_>, root: DirId) {
        let Some(record) = self.exports.get(&root) else {
            return;
        };
        let ExportState::Notifying {
            notify_acks_pending,
            ..
        } = &record.state
        else {
            return;
        };
        if !notify_acks_pending.is_empty() {
            return;
        }

        let mut record = self.exports.remove(&root).expect("checked above");
        let ExportState::Notifying { bounds, .. } = record.state else {
            unreachable!("matched above");
        };
        let peer = record.peer;

        tracing::info!(rank = %self.rank, %root, %peer, "export finished");
        metrics::counter!("grove_migrator_exports_completed").increment(1);

        ctx.send(
            peer,
            MigrationMessage::ExportFinish(ExportFinishPayload { root }),
        );

        ctx.cache.adjust_subtree_auth(root, Authority::sole(peer));
        // Clear the remaining local assertions over the region; the inodes
        // were already stripped during encoding.
        codec::strip_imported_region(ctx.cache, root, &bounds);
        ctx.cache.unfreeze_tree(root);
        ctx.cache.try_subtree_merge(root);
        for bound in &bounds {
            ctx.cache.unpin_export_bound(*bound);
        }
        ctx.cache.path_unpin(root);
        // Replica tracking for the region belongs to the importer now.
        ctx.cache.discard_delayed_expire(root);

        for waiter in record.finish_waiters.drain(..) {
            let _ = waiter.send(true);
        }
    }

    /// Reverses a failed export: decode our own buffer back into the cache.
    pub(super) fn export_reverse(&mut self, ctx: &mut MigratorCtx<'_>, root: DirId) {
        let Some(mut record) = self.exports.remove(&root) else {
            return;
        };
        let ExportState::Exporting {
            bounds, encoded, ..
        } = &record.state
        else {
            self.exports.insert(root, record);
            return;
        };
        let (bounds, encoded) = (bounds.clone(), encoded.clone());
        let peer = record.peer;

        tracing::warn!(rank = %self.rank, %root, %peer, "reversing export");
        metrics::counter!("grove_migrator_exports_reversed").increment(1);

        ctx.cache.adjust_subtree_auth(root, Authority::sole(self.rank));

        let payload = ExportPayload::from_bytes(&encoded).expect("own buffer decodes");
        let reaps = codec::decode_subtree(ctx.cache, &payload, peer);
        ctx.client_outbox.extend(reaps);

        for bound in &bounds {
            ctx.cache.unpin_export_bound(*bound);
        }
        ctx.cache.unfreeze_tree(root);
        ctx.cache.path_unpin(root);
        // We are the authority again: expires delayed during the freeze
        // apply now, and peers with the ambiguous view resolve through the
        // next authority gossip.
        ctx.cache.process_delayed_expire(root);
        ctx.cache.note_pending_import_maps();

        for waiter in record.finish_waiters.drain(..) {
            let _ = waiter.send(false);
        }
    }

    // =======================================================================
    // Importer side
    // =======================================================================

    fn handle_export_discover(
        &mut self,
        ctx: &mut MigratorCtx<'_>,
        from: MdsId,
        p: ExportDiscoverPayload,
    ) {
        let ino = p.root.ino();
        if let Some(record) = self.imports.get(&ino) {
            if record.peer == from && record.phase() == ImportPhase::Discovered {
                // Duplicate discover: re-ack.
                ctx.send(
                    from,
                    MigrationMessage::ExportDiscoverAck(ExportDiscoverAckPayload { root: p.root }),
                );
            } else {
                tracing::debug!(rank = %self.rank, root = %p.root, phase = ?record.phase(), "discover while import in flight, dropping");
            }
            return;
        }

        // Discover fetch: instantiate the root inode from the record. A
        // root that cannot be resolved is fatal here; restart recovers
        // through the journal.
        ctx.cache.resolve_discover(p.discover);
        assert!(
            ctx.cache.inode(ino).is_some(),
            "discover failed to resolve {ino}"
        );
        ctx.cache.pin_importing(p.root);

        self.imports.insert(ino, ImportRecord::new(from));
        ctx.send(
            from,
            MigrationMessage::ExportDiscoverAck(ExportDiscoverAckPayload { root: p.root }),
        );
    }

    fn handle_export_prep(
        &mut self,
        ctx: &mut MigratorCtx<'_>,
        from: MdsId,
        p: ExportPrepPayload,
    ) {
        let ino = p.root.ino();
        let Some(record) = self.imports.get_mut(&ino) else {
            tracing::debug!(rank = %self.rank, root = %p.root, "prep for unknown import, dropping");
            return;
        };
        if record.peer != from || record.phase() != ImportPhase::Discovered {
            tracing::debug!(rank = %self.rank, root = %p.root, phase = ?record.phase(), "prep out of phase, dropping");
            return;
        }

        // Reconstitute the spanning context: root dir, ancestor chain for
        // every bound, then the bound directories themselves.
        ctx.cache.resolve_discover(p.root_discover);
        if !ctx.cache.has_dir(p.root) {
            ctx.cache
                .insert_dir(crate::cache::Dir::new(p.root, false));
        }
        for trace in &p.traces {
            for discover in &trace.dirs {
                ctx.cache.resolve_discover(*discover);
                if !ctx.cache.has_dir(discover.dir) {
                    ctx.cache
                        .insert_dir(crate::cache::Dir::new(discover.dir, false));
                }
            }
            for step in &trace.steps {
                ctx.cache.resolve_trace_step(step);
            }
        }

        let bystanders: BTreeSet<MdsId> = p.bystanders.iter().copied().collect();
        let mut bounds = BTreeSet::new();
        let mut pending_opens = BTreeSet::new();
        for bound_ino in &p.bound_inos {
            let bound = DirId::from(*bound_ino);
            if ctx.cache.open_remote_dir(*bound_ino) {
                ctx.cache.pin_import_bound(bound);
                bounds.insert(bound);
            } else {
                // Suspended: completes through the node loop.
                pending_opens.insert(bound);
            }
        }

        let record = self.imports.get_mut(&ino).expect("checked above");
        record.state = ImportState::Prepping {
            bound_inos: p.bound_inos,
            pending_opens,
            bounds,
            bystanders,
        };
        self.maybe_import_prep_finish(ctx, p.root);
    }

    /// Remote directory open continuation.
    pub fn remote_dir_opened(&mut self, ctx: &mut MigratorCtx<'_>, dir: DirId) {
        let mut finished_root = None;
        for (ino, record) in &mut self.imports {
            if let ImportState::Prepping {
                pending_opens,
                bounds,
                ..
            } = &mut record.state
            {
                if pending_opens.remove(&dir) {
                    ctx.cache.pin_import_bound(dir);
                    bounds.insert(dir);
                    if pending_opens.is_empty() {
                        finished_root = Some(DirId::from(*ino));
                    }
                    break;
                }
            }
        }
        if let Some(root) = finished_root {
            self.maybe_import_prep_finish(ctx, root);
        }
    }

    /// Completes the prep once the spanning context is fully open.
    fn maybe_import_prep_finish(&mut self, ctx: &mut MigratorCtx<'_>, root: DirId) {
        let ino = root.ino();
        let Some(record) = self.imports.get_mut(&ino) else {
            return;
        };
        let ImportState::Prepping {
            pending_opens,
            bounds,
            bystanders,
            ..
        } = &record.state
        else {
            return;
        };
        if !pending_opens.is_empty() {
            return;
        }
        let (bounds, bystanders) = (bounds.clone(), bystanders.clone());
        let peer = record.peer;

        // A bound we have never heard of still terminates the region; its
        // true authority arrives with the next import-map exchange.
        for bound in &bounds {
            if ctx.cache.subtree(*bound).is_none() {
                ctx.cache.register_subtree(*bound, Authority::sole(peer));
            }
        }

        // Freeze the region we are about to receive and assert the
        // ambiguous pair so reads resolve through either side.
        ctx.cache.freeze_tree_nonauth(root);
        ctx.cache
            .adjust_subtree_auth(root, Authority::ambiguous(peer, self.rank));

        let record = self.imports.get_mut(&ino).expect("checked above");
        record.state = ImportState::Prepped { bounds, bystanders };
        ctx.send(
            peer,
            MigrationMessage::ExportPrepAck(ExportPrepAckPayload { root }),
        );
    }

    fn handle_export(&mut self, ctx: &mut MigratorCtx<'_>, from: MdsId, p: ExportPayloadMsg) {
        let ino = p.root.ino();
        let Some(record) = self.imports.get_mut(&ino) else {
            tracing::debug!(rank = %self.rank, root = %p.root, "bulk export for unknown import, dropping");
            return;
        };
        if record.peer != from {
            return;
        }
        let ImportState::Prepped { bounds, bystanders } = &record.state else {
            tracing::debug!(rank = %self.rank, root = %p.root, phase = ?record.phase(), "bulk export out of phase, dropping");
            return;
        };
        let (bounds, bystanders) = (bounds.clone(), bystanders.clone());

        assert!(
            ctx.cache.dir(p.root).is_some_and(|d| d.is_frozen()),
            "bulk data for {root} arrived while not frozen",
            root = p.root
        );

        let payload = ExportPayload::from_bytes(&p.data).expect("bulk payload decodes");
        let reaps = codec::decode_subtree(ctx.cache, &payload, from);
        ctx.client_outbox.extend(reaps);
        ctx.cache.verify_subtree_bounds(p.root, &bounds);

        let seq = ctx.journal.submit_entry(JournalEvent::ImportStart {
            root: p.root,
            bounds: bounds.iter().copied().collect(),
        });
        self.logged.insert(seq, (p.root, LoggedKind::ImportStart));

        let record = self.imports.get_mut(&ino).expect("checked above");
        record.state = ImportState::LoggingStart { bounds, bystanders };
    }

    /// `ImportStart` durable: ack the bulk payload.
    fn import_logged_start(&mut self, ctx: &mut MigratorCtx<'_>, root: DirId) {
        let ino = root.ino();
        let Some(record) = self.imports.get_mut(&ino) else {
            return;
        };
        let ImportState::LoggingStart { bounds, bystanders } = &record.state else {
            return;
        };
        let (bounds, bystanders) = (bounds.clone(), bystanders.clone());
        let peer = record.peer;

        record.state = ImportState::Acking { bounds, bystanders };
        ctx.send(peer, MigrationMessage::ExportAck(ExportAckPayload { root }));
    }

    fn handle_export_finish(
        &mut self,
        ctx: &mut MigratorCtx<'_>,
        from: MdsId,
        p: ExportFinishPayload,
    ) {
        let ino = p.root.ino();
        let Some(record) = self.imports.get(&ino) else {
            tracing::debug!(rank = %self.rank, root = %p.root, "finish for unknown import, dropping");
            return;
        };
        if record.peer != from || record.phase() != ImportPhase::Acking {
            tracing::debug!(rank = %self.rank, root = %p.root, phase = ?record.phase(), "finish out of phase, dropping");
            return;
        }
        self.import_finish(ctx, p.root);
    }

    /// Terminal import commit.
    fn import_finish(&mut self, ctx: &mut MigratorCtx<'_>, root: DirId) {
        let ino = root.ino();
        let record = self.imports.remove(&ino).expect("caller checked");
        let ImportState::Acking { bounds, .. } = record.state else {
            unreachable!("import_finish only runs from ACKING");
        };

        tracing::info!(rank = %self.rank, %root, peer = %record.peer, "import finished");
        metrics::counter!("grove_migrator_imports_completed").increment(1);

        // Durable commit record; no barrier is required past this point.
        ctx.journal.submit_entry(JournalEvent::ImportFinish {
            root,
            committed: true,
        });

        ctx.cache.adjust_subtree_auth(root, Authority::sole(self.rank));
        ctx.cache.unfreeze_tree(root);
        for bound in &bounds {
            ctx.cache.unpin_import_bound(*bound);
        }
        ctx.cache.unpin_importing(root);
        ctx.cache.try_subtree_merge(root);
        ctx.balancer.add_import(root);

        // An empty directory we now own under someone else's parent goes
        // straight back to the parent's authority.
        self.export_empty_import(ctx, root);
    }

    /// Unwinds an import that cannot commit (exporter died before the bulk
    /// transfer resolved). `strip` controls the full reverse walk, needed
    /// only once bulk data was integrated.
    pub(super) fn import_reverse(&mut self, ctx: &mut MigratorCtx<'_>, root: DirId, strip: bool) {
        let ino = root.ino();
        let Some(record) = self.imports.get(&ino) else {
            return;
        };
        let (bounds, bystanders) = match &record.state {
            ImportState::Prepped { bounds, bystanders }
            | ImportState::LoggingStart { bounds, bystanders } => {
                (bounds.clone(), bystanders.clone())
            }
            _ => return,
        };
        let peer = record.peer;

        tracing::warn!(rank = %self.rank, %root, %peer, strip, "reversing import");
        metrics::counter!("grove_migrator_imports_reversed").increment(1);

        if strip {
            codec::strip_imported_region(ctx.cache, root, &bounds);
            ctx.journal.submit_entry(JournalEvent::ImportFinish {
                root,
                committed: false,
            });
        }

        ctx.cache.adjust_subtree_auth(root, Authority::sole(peer));
        ctx.cache.try_subtree_merge(root);

        if bystanders.is_empty() {
            self.import_reverse_cleanup(ctx, root, &bounds);
        } else {
            // Tell the bystanders the pair collapsed back to the exporter,
            // and wait for them before releasing the region.
            let was = Authority::ambiguous(peer, self.rank);
            let now = Authority::sole(peer);
            for bystander in &bystanders {
                ctx.send(
                    *bystander,
                    MigrationMessage::ExportNotify(ExportNotifyPayload {
                        root,
                        was,
                        now,
                        bounds: bounds.iter().copied().collect(),
                    }),
                );
            }
            let record = self.imports.get_mut(&ino).expect("checked above");
            record.state = ImportState::Aborting {
                notify_acks_pending: bystanders,
            };
        }
    }

    /// Final unwind of an aborted import: thaw, unpin, drop the record.
    pub(super) fn import_reverse_cleanup(
        &mut self,
        ctx: &mut MigratorCtx<'_>,
        root: DirId,
        bounds: &BTreeSet<DirId>,
    ) {
        ctx.cache.unfreeze_tree(root);
        ctx.cache.try_subtree_merge(root);
        for bound in bounds {
            ctx.cache.unpin_import_bound(*bound);
        }
        ctx.cache.unpin_importing(root);
        self.imports.remove(&root.ino());
    }

    // =======================================================================
    // Bystander side
    // =======================================================================

    fn handle_export_notify(
        &mut self,
        ctx: &mut MigratorCtx<'_>,
        from: MdsId,
        p: ExportNotifyPayload,
    ) {
        tracing::debug!(
            rank = %self.rank, root = %p.root, was = %p.was, now = %p.now,
            "authority notify"
        );
        ctx.cache.adjust_subtree_auth(p.root, p.now);
        if !p.now.is_ambiguous() {
            // Resolved: adjacent regions may share authority again.
            ctx.cache.try_subtree_merge(p.root);
        }
        ctx.send(
            from,
            MigrationMessage::ExportNotifyAck(ExportNotifyAckPayload { root: p.root }),
        );
    }

    fn handle_export_notify_ack(
        &mut self,
        ctx: &mut MigratorCtx<'_>,
        from: MdsId,
        p: ExportNotifyAckPayload,
    ) {
        enum Advance {
            Go,
            Finish,
            Stay,
        }
        if let Some(record) = self.exports.get_mut(&p.root) {
            let advance = match &mut record.state {
                ExportState::Warning {
                    warning_acks_pending,
                    ..
                } => {
                    warning_acks_pending.remove(&from);
                    Advance::Go
                }
                ExportState::Notifying {
                    notify_acks_pending,
                    ..
                } => {
                    notify_acks_pending.remove(&from);
                    Advance::Finish
                }
                _ => {
                    tracing::debug!(rank = %self.rank, root = %p.root, phase = ?record.phase(), "notify-ack out of phase, dropping");
                    Advance::Stay
                }
            };
            match advance {
                Advance::Go => self.maybe_export_go(ctx, p.root),
                Advance::Finish => self.maybe_export_finish(ctx, p.root),
                Advance::Stay => {}
            }
            return;
        }

        let ino = p.root.ino();
        if let Some(record) = self.imports.get_mut(&ino) {
            if let ImportState::Aborting {
                notify_acks_pending,
            } = &mut record.state
            {
                notify_acks_pending.remove(&from);
                let done = notify_acks_pending.is_empty();
                if done {
                    let bounds = ctx.cache.get_subtree_bounds(p.root);
                    self.import_reverse_cleanup(ctx, p.root, &bounds);
                }
                return;
            }
        }

        tracing::debug!(rank = %self.rank, root = %p.root, %from, "notify-ack with no matching record, dropping");
    }

    // =======================================================================
    // Empty-import re-export
    // =======================================================================

    /// An empty directory we hold as an import under a parent inode authored
    /// elsewhere goes back to the parent's authority.
    pub fn export_empty_import(&mut self, ctx: &mut MigratorCtx<'_>, dir: DirId) {
        let Some(d) = ctx.cache.dir(dir) else {
            return;
        };
        if !d.auth || d.is_freezing() || d.is_frozen() {
            return;
        }
        if dir.ino() == ROOT_INO {
            return;
        }
        // The inode being authored here means this is not an import at all.
        if ctx.cache.inode(dir.ino()).is_some_and(|i| i.auth) {
            return;
        }
        if d.size() > 0 {
            return;
        }
        if !d.complete {
            // Might not actually be empty: fetch, then re-check from the
            // completion.
            ctx.cache.fetch_dir(dir);
            return;
        }

        let Some((parent_dir, _)) = ctx.cache.parent_of(dir) else {
            return;
        };
        let Some(parent_auth) = ctx.cache.authority_of(parent_dir) else {
            return;
        };
        let dest = parent_auth.primary;
        if dest == self.rank {
            return;
        }
        tracing::info!(rank = %self.rank, %dir, %dest, "re-exporting empty import");
        self.export_subtree(ctx, dir, dest);
    }

    /// Directory fetch continuation for the empty-import check.
    pub fn dir_fetched(&mut self, ctx: &mut MigratorCtx<'_>, dir: DirId) {
        self.export_empty_import(ctx, dir);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use grove_core::InodeKind;

    use crate::cache::{Dir, Inode};
    use crate::mdsmap::MdsMap;

    use super::*;

    /// Owns every collaborator so handlers can be driven without a node loop.
    struct Fixture {
        cache: MetaCache,
        journal: Journal,
        balancer: Balancer,
        mdsmap: Arc<MdsMap>,
        outbox: Vec<(MdsId, MigrationMessage)>,
        client_outbox: Vec<CapMessage>,
    }

    impl Fixture {
        fn new(rank: MdsId) -> Self {
            Self {
                cache: MetaCache::new(rank),
                journal: Journal::in_memory(),
                balancer: Balancer::new(),
                mdsmap: Arc::new(MdsMap::with_active([MdsId(0), MdsId(1), MdsId(2)])),
                outbox: Vec::new(),
                client_outbox: Vec::new(),
            }
        }

        fn ctx(&mut self) -> MigratorCtx<'_> {
            MigratorCtx {
                cache: &mut self.cache,
                journal: &mut self.journal,
                balancer: &mut self.balancer,
                mdsmap: self.mdsmap.clone(),
                outbox: &mut self.outbox,
                client_outbox: &mut self.client_outbox,
            }
        }

        fn seed_dir(&mut self, id: DirId, auth: bool) {
            self.cache
                .insert_inode(Inode::new_auth(id.ino(), InodeKind::Dir, None));
            self.cache.insert_dir(Dir::new(id, auth));
        }
    }

    const SUBTREE: DirId = DirId(0x10);

    #[test]
    fn export_to_self_is_silent_noop() {
        let mut fx = Fixture::new(MdsId(0));
        fx.seed_dir(SUBTREE, true);
        let mut migrator = Migrator::new(MdsId(0));
        migrator.export_subtree(&mut fx.ctx(), SUBTREE, MdsId(0));
        assert_eq!(migrator.export_count(), 0);
        assert!(fx.outbox.is_empty());
    }

    #[test]
    fn export_of_filesystem_root_is_silent_noop() {
        let mut fx = Fixture::new(MdsId(0));
        fx.seed_dir(DirId(ROOT_INO.0), true);
        let mut migrator = Migrator::new(MdsId(0));
        migrator.export_subtree(&mut fx.ctx(), DirId(ROOT_INO.0), MdsId(1));
        assert_eq!(migrator.export_count(), 0);
    }

    #[test]
    fn export_of_non_auth_dir_is_silent_noop() {
        let mut fx = Fixture::new(MdsId(0));
        fx.seed_dir(SUBTREE, false);
        let mut migrator = Migrator::new(MdsId(0));
        migrator.export_subtree(&mut fx.ctx(), SUBTREE, MdsId(1));
        assert_eq!(migrator.export_count(), 0);
    }

    #[test]
    fn export_of_hashed_dir_is_silent_noop() {
        let mut fx = Fixture::new(MdsId(0));
        fx.seed_dir(SUBTREE, true);
        fx.cache.dir_mut(SUBTREE).unwrap().hashed = true;
        let mut migrator = Migrator::new(MdsId(0));
        migrator.export_subtree(&mut fx.ctx(), SUBTREE, MdsId(1));
        assert_eq!(migrator.export_count(), 0);
    }

    #[test]
    fn export_of_frozen_dir_is_silent_noop() {
        let mut fx = Fixture::new(MdsId(0));
        fx.seed_dir(SUBTREE, true);
        fx.cache.freeze_tree(SUBTREE);
        let _ = fx.cache.take_completions();
        let mut migrator = Migrator::new(MdsId(0));
        migrator.export_subtree(&mut fx.ctx(), SUBTREE, MdsId(1));
        assert_eq!(migrator.export_count(), 0);
    }

    #[test]
    fn export_while_degraded_is_silent_noop() {
        let mut fx = Fixture::new(MdsId(0));
        fx.seed_dir(SUBTREE, true);
        fx.mdsmap = Arc::new(fx.mdsmap.with_failure(MdsId(2)));
        let mut migrator = Migrator::new(MdsId(0));
        migrator.export_subtree(&mut fx.ctx(), SUBTREE, MdsId(1));
        assert_eq!(migrator.export_count(), 0);
    }

    #[test]
    fn export_starts_discover_and_freeze() {
        let mut fx = Fixture::new(MdsId(0));
        fx.seed_dir(SUBTREE, true);
        let mut migrator = Migrator::new(MdsId(0));
        migrator.export_subtree(&mut fx.ctx(), SUBTREE, MdsId(1));

        assert_eq!(migrator.export_phase(SUBTREE), Some(ExportPhase::Discovering));
        assert!(fx.cache.dir(SUBTREE).unwrap().is_freezing());
        assert_eq!(fx.outbox.len(), 1);
        let (to, msg) = &fx.outbox[0];
        assert_eq!(*to, MdsId(1));
        assert_eq!(msg.kind(), "EXPORT-DISCOVER");

        // A second call while the first is in flight changes nothing.
        migrator.export_subtree(&mut fx.ctx(), SUBTREE, MdsId(2));
        assert_eq!(migrator.export_count(), 1);
        assert_eq!(fx.outbox.len(), 1);
    }

    #[test]
    fn stray_acks_are_discarded() {
        let mut fx = Fixture::new(MdsId(0));
        let mut migrator = Migrator::new(MdsId(0));
        for msg in [
            MigrationMessage::ExportDiscoverAck(ExportDiscoverAckPayload { root: SUBTREE }),
            MigrationMessage::ExportPrepAck(ExportPrepAckPayload { root: SUBTREE }),
            MigrationMessage::ExportAck(ExportAckPayload { root: SUBTREE }),
            MigrationMessage::ExportNotifyAck(ExportNotifyAckPayload { root: SUBTREE }),
            MigrationMessage::ExportFinish(ExportFinishPayload { root: SUBTREE }),
        ] {
            migrator.dispatch(&mut fx.ctx(), MdsId(1), msg);
        }
        assert_eq!(migrator.export_count(), 0);
        assert_eq!(migrator.import_count(), 0);
        assert!(fx.outbox.is_empty());
    }

    #[test]
    fn finish_waiter_resolves_immediately_without_record() {
        let mut migrator = Migrator::new(MdsId(0));
        let mut rx = migrator.add_finish_waiter(SUBTREE);
        assert!(!rx.try_recv().expect("resolved immediately"));
    }
}
