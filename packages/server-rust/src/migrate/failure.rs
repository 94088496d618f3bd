//! Peer-failure handling for in-flight migrations.
//!
//! Invoked with the rank of a failed MDS, once per failure declaration from
//! the membership service. Every affected migration is unwound or completed
//! according to its phase: before the commit point the surviving side takes
//! the subtree back; after it, the migration is already durable and rolls
//! forward. A dead bystander's outstanding ack is synthesized so the
//! protocol never waits on a rank that will not answer.

use grove_core::{DirId, MdsId};

use crate::cache::MetaCache;

use super::migrator::{Migrator, MigratorCtx};
use super::types::{ExportPhase, ExportState, ImportState};

impl Migrator {
    /// Unwinds or advances every migration involving `who`.
    pub fn handle_mds_failure(&mut self, ctx: &mut MigratorCtx<'_>, who: MdsId) {
        tracing::warn!(rank = %self.rank(), failed = %who, "handling MDS failure");

        self.fail_exports_to(ctx, who);
        self.synthesize_bystander_acks(ctx, who);
        self.fail_imports_from(ctx, who);

        // Cleaning may have changed our subtree map; peers learn through
        // the next import-map exchange.
        ctx.cache.send_pending_import_maps();
    }

    /// Exports whose destination died.
    fn fail_exports_to(&mut self, ctx: &mut MigratorCtx<'_>, who: MdsId) {
        let affected: Vec<(DirId, ExportPhase)> = self
            .exports_mut()
            .iter()
            .filter(|(_, record)| record.peer == who)
            .map(|(root, record)| (*root, record.phase()))
            .collect();

        for (root, phase) in affected {
            tracing::warn!(rank = %self.rank(), %root, ?phase, "export peer died");
            match phase {
                ExportPhase::Discovering => {
                    // Cancel the freeze before dropping the pin, so the pin
                    // release cannot complete a freeze we no longer want.
                    ctx.cache.unfreeze_tree(root);
                    ctx.cache.auth_unpin(root);
                    self.drop_export(ctx.cache, root);
                }
                ExportPhase::Freezing => {
                    ctx.cache.unfreeze_tree(root);
                    self.drop_export(ctx.cache, root);
                }
                ExportPhase::Prepping | ExportPhase::Warning => {
                    let bounds = match &self.exports_mut().get(&root).expect("collected").state {
                        ExportState::Prepping { bounds, .. }
                        | ExportState::Warning { bounds, .. } => bounds.clone(),
                        _ => unreachable!("phase matched above"),
                    };
                    for bound in &bounds {
                        ctx.cache.unpin_export_bound(*bound);
                    }
                    ctx.cache.unfreeze_tree(root);
                    ctx.cache
                        .adjust_subtree_auth(root, grove_core::Authority::sole(self.rank()));
                    ctx.cache.try_subtree_merge(root);
                    self.drop_export(ctx.cache, root);
                }
                ExportPhase::Exporting => {
                    self.export_reverse(ctx, root);
                }
                // Past the commit point: the migration succeeded durably on
                // the importer (or will, once our journal flush returns).
                // The record stays so the remaining acks keep processing.
                ExportPhase::LoggingFinish | ExportPhase::Notifying => {}
            }
        }
    }

    /// Drops an export record, releasing the path pin and waking waiters
    /// with failure.
    fn drop_export(&mut self, cache: &mut MetaCache, root: DirId) {
        cache.path_unpin(root);
        if let Some(mut record) = self.exports_mut().remove(&root) {
            for waiter in record.finish_waiters.drain(..) {
                let _ = waiter.send(false);
            }
        }
    }

    /// A dead rank leaves every bystander set, and its outstanding acks are
    /// synthesized so ack barriers drain. Removing it from the `bystanders`
    /// sets as well keeps later notify rounds from waiting on it.
    fn synthesize_bystander_acks(&mut self, ctx: &mut MigratorCtx<'_>, who: MdsId) {
        let mut go = Vec::new();
        let mut finish = Vec::new();
        for (root, record) in self.exports_mut().iter_mut() {
            match &mut record.state {
                ExportState::Prepping { bystanders, .. } => {
                    bystanders.remove(&who);
                }
                ExportState::Warning {
                    bystanders,
                    warning_acks_pending,
                    ..
                } => {
                    bystanders.remove(&who);
                    if warning_acks_pending.remove(&who) {
                        tracing::warn!(%root, bystander = %who, "synthesizing warning ack");
                        go.push(*root);
                    }
                }
                ExportState::Exporting { bystanders, .. }
                | ExportState::LoggingFinish { bystanders, .. } => {
                    bystanders.remove(&who);
                }
                ExportState::Notifying {
                    notify_acks_pending,
                    ..
                } => {
                    if notify_acks_pending.remove(&who) {
                        tracing::warn!(%root, bystander = %who, "synthesizing notify ack");
                        finish.push(*root);
                    }
                }
                ExportState::Discovering | ExportState::Freezing => {}
            }
        }
        for root in go {
            self.maybe_export_go(ctx, root);
        }
        for root in finish {
            self.maybe_export_finish(ctx, root);
        }

        // The importer's abort round waits on bystanders too.
        let mut aborted = Vec::new();
        for (ino, record) in self.imports_mut().iter_mut() {
            match &mut record.state {
                ImportState::Prepping { bystanders, .. }
                | ImportState::Prepped { bystanders, .. }
                | ImportState::LoggingStart { bystanders, .. }
                | ImportState::Acking { bystanders, .. } => {
                    bystanders.remove(&who);
                }
                ImportState::Aborting {
                    notify_acks_pending,
                } => {
                    if notify_acks_pending.remove(&who) && notify_acks_pending.is_empty() {
                        aborted.push(DirId::from(*ino));
                    }
                }
                ImportState::Discovered => {}
            }
        }
        for root in aborted {
            let bounds = ctx.cache.get_subtree_bounds(root);
            self.import_reverse_cleanup(ctx, root, &bounds);
        }
    }

    /// Imports whose source died.
    fn fail_imports_from(&mut self, ctx: &mut MigratorCtx<'_>, who: MdsId) {
        enum Action {
            DropPins(Vec<DirId>),
            Reverse { strip: bool },
            MarkAmbiguous(Vec<DirId>),
            Ignore,
        }

        let affected: Vec<(DirId, Action)> = self
            .imports_mut()
            .iter()
            .filter(|(_, record)| record.peer == who)
            .map(|(ino, record)| {
                let action = match &record.state {
                    ImportState::Discovered => Action::DropPins(Vec::new()),
                    // Not yet frozen; only the pins need releasing.
                    ImportState::Prepping { bounds, .. } => {
                        Action::DropPins(bounds.iter().copied().collect())
                    }
                    ImportState::Prepped { .. } => Action::Reverse { strip: false },
                    ImportState::LoggingStart { .. } => Action::Reverse { strip: true },
                    // The exporter committed locally before our ack was
                    // processed; only the cluster-wide exchange can say
                    // whether the export became durable. Keep the record.
                    ImportState::Acking { bounds, .. } => {
                        Action::MarkAmbiguous(bounds.iter().copied().collect())
                    }
                    // Already unwinding.
                    ImportState::Aborting { .. } => Action::Ignore,
                };
                (DirId::from(*ino), action)
            })
            .collect();

        for (root, action) in affected {
            tracing::warn!(rank = %self.rank(), %root, "import peer died");
            match action {
                Action::DropPins(bounds) => {
                    for bound in &bounds {
                        ctx.cache.unpin_import_bound(*bound);
                    }
                    ctx.cache.unpin_importing(root);
                    self.imports_mut().remove(&root.ino());
                }
                Action::Reverse { strip } => {
                    self.import_reverse(ctx, root, strip);
                }
                Action::MarkAmbiguous(bounds) => {
                    ctx.cache.add_ambiguous_import(root, bounds);
                }
                Action::Ignore => {}
            }
        }
    }
}
