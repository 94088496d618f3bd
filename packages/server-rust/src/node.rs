//! The MDS node: one task owning cache, journal, balancer, and Migrator.
//!
//! Every Migrator entry point — message dispatch, freeze completions,
//! journal durability, directory fetches, failure declarations, and the
//! balancer's export call — arrives as a [`NodeEvent`] on one queue and is
//! processed to completion before the next. There is no mutual exclusion
//! anywhere in the migration path because there is no concurrency: the node
//! loop is the serialization point.

use std::collections::VecDeque;
use std::sync::Arc;

use grove_core::{CapMessage, DirId, MdsId};

use crate::balancer::Balancer;
use crate::cache::{CacheCompletion, MetaCache};
use crate::config::MdsConfig;
use crate::journal::Journal;
use crate::mdsmap::{BeaconMonitor, MdsMapHandle};
use crate::migrate::{ExportPhase, ImportPhase, MigrationMessage, Migrator, MigratorCtx};
use crate::transport::{Envelope, Transport};

// ---------------------------------------------------------------------------
// NodeEvent
// ---------------------------------------------------------------------------

/// One unit of work for the node loop.
#[derive(Debug)]
pub enum NodeEvent {
    /// A protocol message from a peer rank.
    Message { from: MdsId, msg: MigrationMessage },
    /// Freeze completion from the cache.
    SubtreeFrozen(DirId),
    /// Remote directory open completion (importer prep).
    RemoteDirOpened(DirId),
    /// Directory fetch completion (empty-import check).
    DirFetched(DirId),
    /// A journal entry became durable.
    JournalDurable(u64),
    /// The membership service declared a rank failed.
    PeerFailure(MdsId),
    /// Balancer call-in: start exporting `root` to `dest`.
    ExportSubtree { root: DirId, dest: MdsId },
}

// ---------------------------------------------------------------------------
// MdsNode
// ---------------------------------------------------------------------------

/// A single metadata server.
pub struct MdsNode {
    config: MdsConfig,
    cache: MetaCache,
    journal: Journal,
    balancer: Balancer,
    migrator: Migrator,
    mdsmap: Arc<MdsMapHandle>,
    beacons: BeaconMonitor,
    transport: Arc<dyn Transport>,
    events: VecDeque<NodeEvent>,
    /// Capability traffic owed to clients, staged for the session layer.
    client_messages: Vec<CapMessage>,
}

impl MdsNode {
    #[must_use]
    pub fn new(
        config: MdsConfig,
        journal: Journal,
        mdsmap: Arc<MdsMapHandle>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let rank = config.rank;
        let beacons = BeaconMonitor::new(config.beacon_grace_ms);
        Self {
            config,
            cache: MetaCache::new(rank),
            journal,
            balancer: Balancer::new(),
            migrator: Migrator::new(rank),
            mdsmap,
            beacons,
            transport,
            events: VecDeque::new(),
            client_messages: Vec::new(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> MdsId {
        self.config.rank
    }

    // -- access for the balancer, recovery, and tests ----------------------

    #[must_use]
    pub fn cache(&self) -> &MetaCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut MetaCache {
        &mut self.cache
    }

    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    #[must_use]
    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    #[must_use]
    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    pub fn migrator_mut(&mut self) -> &mut Migrator {
        &mut self.migrator
    }

    /// Takes the capability messages owed to clients since the last call.
    pub fn take_client_messages(&mut self) -> Vec<CapMessage> {
        std::mem::take(&mut self.client_messages)
    }

    /// Toggles eager journal flushing. Tests disable it to model a rank
    /// dying between submit and durability.
    pub fn set_journal_auto_flush(&mut self, auto_flush: bool) {
        self.config.journal_auto_flush = auto_flush;
    }

    // -- event intake -------------------------------------------------------

    pub fn enqueue(&mut self, event: NodeEvent) {
        self.events.push_back(event);
    }

    /// Wire intake: a message from `from` enters the event queue.
    pub fn deliver(&mut self, from: MdsId, msg: MigrationMessage) {
        self.enqueue(NodeEvent::Message { from, msg });
    }

    /// Liveness beacon from a peer rank.
    pub fn note_beacon(&mut self, rank: MdsId, timestamp_ms: u64) {
        self.beacons.beacon(rank, timestamp_ms);
    }

    /// Declares every rank whose beacon grace elapsed failed, fanning the
    /// declarations out to the Migrator through the event queue.
    pub fn sweep_beacons(&mut self, now_ms: u64) {
        for rank in self.beacons.take_expired(now_ms) {
            self.mdsmap.mark_failed(rank);
            self.enqueue(NodeEvent::PeerFailure(rank));
        }
    }

    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.events.is_empty()
    }

    // -- the loop -----------------------------------------------------------

    /// Processes one event. Returns `false` when the queue is empty.
    pub async fn step(&mut self) -> anyhow::Result<bool> {
        let Some(event) = self.events.pop_front() else {
            return Ok(false);
        };

        let mut outbox: Vec<(MdsId, MigrationMessage)> = Vec::new();
        let mut client_outbox: Vec<CapMessage> = Vec::new();
        {
            let mut ctx = MigratorCtx {
                cache: &mut self.cache,
                journal: &mut self.journal,
                balancer: &mut self.balancer,
                mdsmap: self.mdsmap.current(),
                outbox: &mut outbox,
                client_outbox: &mut client_outbox,
            };
            match event {
                NodeEvent::Message { from, msg } => self.migrator.dispatch(&mut ctx, from, msg),
                NodeEvent::SubtreeFrozen(root) => self.migrator.subtree_frozen(&mut ctx, root),
                NodeEvent::RemoteDirOpened(dir) => {
                    self.migrator.remote_dir_opened(&mut ctx, dir);
                }
                NodeEvent::DirFetched(dir) => self.migrator.dir_fetched(&mut ctx, dir),
                NodeEvent::JournalDurable(seq) => self.migrator.journal_durable(&mut ctx, seq),
                NodeEvent::PeerFailure(who) => self.migrator.handle_mds_failure(&mut ctx, who),
                NodeEvent::ExportSubtree { root, dest } => {
                    self.migrator.export_subtree(&mut ctx, root, dest);
                }
            }
        }

        self.client_messages.extend(client_outbox);
        let from = self.config.rank;
        for (to, msg) in outbox {
            self.transport.send(Envelope { from, to, msg }).await?;
        }

        for completion in self.cache.take_completions() {
            self.events.push_back(match completion {
                CacheCompletion::SubtreeFrozen(root) => NodeEvent::SubtreeFrozen(root),
                CacheCompletion::DirFetched(dir) => NodeEvent::DirFetched(dir),
                CacheCompletion::RemoteDirOpened(dir) => NodeEvent::RemoteDirOpened(dir),
            });
        }

        if self.config.journal_auto_flush {
            self.flush_journal()?;
        }

        #[cfg(debug_assertions)]
        self.check_invariants();

        Ok(true)
    }

    /// Makes every pending journal entry durable and queues the durability
    /// events. Exposed separately so tests can interleave failures.
    pub fn flush_journal(&mut self) -> anyhow::Result<()> {
        for seq in self.journal.flush_all()? {
            self.events.push_back(NodeEvent::JournalDurable(seq));
        }
        Ok(())
    }

    /// Processes events until the queue drains.
    pub async fn pump(&mut self) -> anyhow::Result<()> {
        while self.step().await? {}
        Ok(())
    }

    /// Runs the node until `shutdown` flips.
    pub async fn run(
        &mut self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let idle = std::time::Duration::from_millis(self.config.beacon_interval_ms);
        loop {
            self.pump().await?;
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            self.sweep_beacons(now_ms);
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(rank = %self.config.rank, "node loop shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Phase-side invariants that must hold after every handler: a record's
    /// phase and its subtree's authority shape may not contradict.
    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        use crate::migrate::ExportPhase as EP;
        use crate::migrate::ImportPhase as IP;

        for (root, phase) in self.export_phases() {
            if let Some(auth) = self.cache.subtree_auth(root) {
                let ambiguous_ok =
                    matches!(phase, EP::Exporting | EP::LoggingFinish | EP::Notifying);
                assert!(
                    !auth.is_ambiguous() || ambiguous_ok,
                    "{root}: ambiguous authority in export phase {phase:?}"
                );
            }
        }
        for (root, phase) in self.import_phases() {
            if let Some(auth) = self.cache.subtree_auth(root) {
                let ambiguous_ok =
                    matches!(phase, IP::Prepped | IP::LoggingStart | IP::Acking);
                assert!(
                    !auth.is_ambiguous() || ambiguous_ok,
                    "{root}: ambiguous authority in import phase {phase:?}"
                );
            }
        }
    }

    /// Export records and phases (diagnostics, tests).
    #[must_use]
    pub fn export_phases(&self) -> Vec<(DirId, ExportPhase)> {
        self.migrator
            .export_roots()
            .into_iter()
            .filter_map(|root| self.migrator.export_phase(root).map(|p| (root, p)))
            .collect()
    }

    /// Import records and phases (diagnostics, tests).
    #[must_use]
    pub fn import_phases(&self) -> Vec<(DirId, ImportPhase)> {
        self.migrator
            .import_inos()
            .into_iter()
            .filter_map(|ino| {
                self.migrator
                    .import_phase(ino)
                    .map(|p| (DirId::from(ino), p))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::mdsmap::MdsMap;
    use crate::transport::QueueTransport;

    use super::*;

    fn make_node(rank: u16) -> MdsNode {
        let config = MdsConfig {
            rank: MdsId(rank),
            ..MdsConfig::default()
        };
        let mdsmap = Arc::new(MdsMapHandle::new(MdsMap::with_active([
            MdsId(0),
            MdsId(1),
            MdsId(2),
        ])));
        MdsNode::new(
            config,
            Journal::in_memory(),
            mdsmap,
            Arc::new(QueueTransport::new()),
        )
    }

    #[tokio::test]
    async fn step_is_idle_on_empty_queue() {
        let mut node = make_node(0);
        assert!(!node.has_work());
        assert!(!node.step().await.unwrap());
    }

    #[tokio::test]
    async fn beacon_expiry_declares_failure() {
        let mut node = make_node(0);
        node.note_beacon(MdsId(1), 1_000);
        node.note_beacon(MdsId(2), 1_000);

        // Within grace: nothing happens.
        node.sweep_beacons(2_000);
        assert!(!node.has_work());

        // Past grace: both ranks are declared failed exactly once.
        let grace = MdsConfig::default().beacon_grace_ms;
        node.sweep_beacons(1_000 + grace + 1);
        assert!(node.has_work());
        node.pump().await.unwrap();

        node.sweep_beacons(1_000 + grace + 2);
        assert!(!node.has_work());
    }
}
