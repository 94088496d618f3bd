//! In-process multi-MDS cluster for protocol tests.
//!
//! Nodes share one membership handle and exchange messages through their
//! queue transports, moved by hand so tests control exactly which messages
//! are delivered before a rank dies. Everything is deterministic: nodes are
//! stepped in rank order, and a tick drains every node's event queue before
//! the wire is routed once.

use std::sync::Arc;

use grove_core::{
    cap_bits, Authority, Capability, ClientId, DirId, InodeId, InodeKind, MdsId, ReplicaNonce,
};

use crate::cache::{Dentry, DentryLink, Dir, Inode, MetaCache};
use crate::config::MdsConfig;
use crate::journal::Journal;
use crate::mdsmap::{MdsMap, MdsMapHandle};
use crate::node::{MdsNode, NodeEvent};
use crate::transport::QueueTransport;

// The canonical namespace: / -> a -> b, with b holding file f1 and the
// bound directory c (a subtree authored by mds2).
pub const ROOT: DirId = DirId(0x1);
pub const DIR_A: DirId = DirId(0x2);
pub const DIR_B: DirId = DirId(0x3);
pub const BOUND_C: DirId = DirId(0x40);
pub const FILE_F1: InodeId = InodeId(0x30);
pub const CLIENT: ClientId = ClientId(7);

pub struct TestCluster {
    pub mdsmap: Arc<MdsMapHandle>,
    nodes: Vec<Option<MdsNode>>,
    transports: Vec<Arc<QueueTransport>>,
}

impl TestCluster {
    pub fn new(n: u16) -> Self {
        let mdsmap = Arc::new(MdsMapHandle::new(MdsMap::with_active((0..n).map(MdsId))));
        let mut nodes = Vec::new();
        let mut transports = Vec::new();
        for rank in 0..n {
            let transport = Arc::new(QueueTransport::new());
            let config = MdsConfig {
                rank: MdsId(rank),
                ..MdsConfig::default()
            };
            nodes.push(Some(MdsNode::new(
                config,
                Journal::in_memory(),
                mdsmap.clone(),
                transport.clone(),
            )));
            transports.push(transport);
        }
        Self {
            mdsmap,
            nodes,
            transports,
        }
    }

    // -- seeding ------------------------------------------------------------

    /// Full namespace on every rank: file under `b`, bound `c` under `b`.
    pub fn seed_default(&mut self) {
        for rank in 0..self.nodes.len() as u16 {
            self.seed_node(rank, true, true);
        }
    }

    /// Namespace with an empty `b`: no file, no bound.
    pub fn seed_empty_b(&mut self) {
        for rank in 0..self.nodes.len() as u16 {
            self.seed_node(rank, false, false);
        }
    }

    fn seed_node(&mut self, rank: u16, with_file: bool, with_bound: bool) {
        let n = self.nodes.len() as u16;
        let node = self.nodes[rank as usize].as_mut().expect("seeding live node");
        let cache = node.cache_mut();
        let auth0 = rank == 0;

        seed_inode(cache, ROOT.ino(), InodeKind::Dir, None, auth0);
        seed_inode(
            cache,
            DIR_A.ino(),
            InodeKind::Dir,
            Some((ROOT, "a".to_string())),
            auth0,
        );
        seed_inode(
            cache,
            DIR_B.ino(),
            InodeKind::Dir,
            Some((DIR_A, "b".to_string())),
            auth0,
        );

        let mut dirs = vec![(ROOT, auth0), (DIR_A, auth0), (DIR_B, auth0)];
        if with_bound {
            // The bound's dirfrag is authored by mds2, but its inode hangs
            // from b's dentry and follows b's region.
            seed_inode(
                cache,
                BOUND_C.ino(),
                InodeKind::Dir,
                Some((DIR_B, "c".to_string())),
                auth0,
            );
            dirs.push((BOUND_C, rank == 2));
        }
        for (id, auth) in dirs {
            let mut dir = Dir::new(id, auth);
            for other in 0..n {
                if other != rank {
                    dir.replicas.insert(MdsId(other), ReplicaNonce(1));
                }
            }
            cache.insert_dir(dir);
        }

        link(cache, ROOT, "a", DIR_A.ino());
        link(cache, DIR_A, "b", DIR_B.ino());
        if with_bound {
            link(cache, DIR_B, "c", BOUND_C.ino());
        }
        if with_file {
            seed_inode(
                cache,
                FILE_F1,
                InodeKind::File,
                Some((DIR_B, "f1".to_string())),
                auth0,
            );
            if auth0 {
                let inode = cache.inode_mut(FILE_F1).expect("just inserted");
                inode
                    .caps
                    .push(Capability::new(CLIENT, cap_bits::READ | cap_bits::CACHE));
            }
            link(cache, DIR_B, "f1", FILE_F1);
        }

        cache.register_subtree(ROOT, Authority::sole(MdsId(0)));
        if with_bound {
            cache.register_subtree(BOUND_C, Authority::sole(MdsId(2)));
        }
    }

    // -- access -------------------------------------------------------------

    pub fn node(&self, rank: u16) -> &MdsNode {
        self.nodes[rank as usize].as_ref().expect("node is alive")
    }

    pub fn node_mut(&mut self, rank: u16) -> &mut MdsNode {
        self.nodes[rank as usize].as_mut().expect("node is alive")
    }

    pub fn is_alive(&self, rank: u16) -> bool {
        self.nodes[rank as usize].is_some()
    }

    pub fn authority(&self, rank: u16, root: DirId) -> Option<Authority> {
        self.node(rank).cache().subtree_auth(root)
    }

    /// Authority of the region containing `dir`, walking up to the nearest
    /// subtree root if `dir` itself merged away.
    pub fn effective_authority(&self, rank: u16, dir: DirId) -> Option<Authority> {
        self.node(rank).cache().authority_of(dir)
    }

    /// Balancer call-in on `from`.
    pub fn export(&mut self, from: u16, root: DirId, dest: u16) {
        self.node_mut(from).enqueue(NodeEvent::ExportSubtree {
            root,
            dest: MdsId(dest),
        });
    }

    // -- failure ------------------------------------------------------------

    /// Drops a rank: queued and in-flight traffic is lost, the membership
    /// map marks it failed, and every survivor gets the failure declaration.
    pub fn kill(&mut self, rank: u16) {
        self.nodes[rank as usize] = None;
        self.transports[rank as usize].drain_all();
        self.mdsmap.mark_failed(MdsId(rank));
        for node in self.nodes.iter_mut().flatten() {
            node.enqueue(NodeEvent::PeerFailure(MdsId(rank)));
        }
    }

    // -- pumping ------------------------------------------------------------

    /// Drains every live node's event queue, then routes the wire once.
    /// Returns `false` when the cluster is quiescent.
    pub async fn tick(&mut self) -> bool {
        let mut progressed = false;
        for node in self.nodes.iter_mut().flatten() {
            while node.step().await.expect("node step") {
                progressed = true;
            }
        }
        progressed |= self.route_once() > 0;
        progressed
    }

    /// Runs until quiescent.
    pub async fn pump(&mut self) {
        while self.tick().await {}
    }

    /// Runs until `pred` holds, panicking if the cluster goes quiescent or
    /// `max_ticks` elapse first.
    pub async fn pump_until(&mut self, max_ticks: usize, pred: impl Fn(&Self) -> bool) {
        for _ in 0..max_ticks {
            if pred(self) {
                return;
            }
            let progressed = self.tick().await;
            if !progressed {
                assert!(pred(self), "cluster went quiescent before predicate held");
                return;
            }
        }
        panic!("predicate not reached within {max_ticks} ticks");
    }

    /// Moves queued envelopes to their destinations. Traffic from or to a
    /// dead rank is dropped, like a closed connection.
    fn route_once(&mut self) -> usize {
        let mut delivered = 0;
        for (i, transport) in self.transports.iter().enumerate() {
            let envelopes = transport.drain_all();
            if self.nodes[i].is_none() {
                continue;
            }
            for envelope in envelopes {
                let dest = envelope.to.0 as usize;
                if let Some(node) = self.nodes.get_mut(dest).and_then(Option::as_mut) {
                    node.deliver(envelope.from, envelope.msg);
                    delivered += 1;
                }
            }
        }
        delivered
    }

    // -- invariants ---------------------------------------------------------

    /// The cluster-wide authority-claim invariant for one subtree root:
    /// between one and two live ranks may claim it, and two only while one
    /// side of a migration is inside its ambiguity window.
    pub fn assert_authority_claims(&self, root: DirId, expected: usize) {
        let claims: Vec<MdsId> = self
            .nodes
            .iter()
            .flatten()
            .filter(|n| n.cache().claims_authority(root))
            .map(MdsNode::rank)
            .collect();
        assert!(
            (1..=2).contains(&claims.len()),
            "authority claims for {root} outside [1,2]: {claims:?}"
        );
        assert_eq!(
            claims.len(),
            expected,
            "authority claims for {root}: {claims:?}"
        );
    }

    /// No migration records anywhere.
    pub fn assert_no_records(&self) {
        for node in self.nodes.iter().flatten() {
            assert_eq!(
                node.migrator().export_count(),
                0,
                "{}: export records remain",
                node.rank()
            );
            assert_eq!(
                node.migrator().import_count(),
                0,
                "{}: import records remain",
                node.rank()
            );
        }
    }
}

fn seed_inode(
    cache: &mut MetaCache,
    ino: InodeId,
    kind: InodeKind,
    parent: Option<(DirId, String)>,
    auth: bool,
) {
    let inode = if auth {
        Inode::new_auth(ino, kind, parent)
    } else {
        Inode::new_replica(ino, kind, parent)
    };
    cache.insert_inode(inode);
}

fn link(cache: &mut MetaCache, dir: DirId, name: &str, ino: InodeId) {
    let auth = cache.dir(dir).is_some_and(|d| d.auth);
    if let Some(dir) = cache.dir_mut(dir) {
        dir.entries
            .insert(name.to_string(), Dentry::new(DentryLink::Primary(ino), auth));
    }
}
