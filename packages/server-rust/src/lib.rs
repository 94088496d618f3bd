//! Grove Server — metadata server node with subtree migration.
//!
//! Layers, innermost first:
//!
//! - [`cache`]: the metadata cache (entity arenas, subtree registry, freeze
//!   and pin machinery)
//! - [`journal`]: write-ahead journal with deferred durability and replay
//! - [`mdsmap`]: cluster membership snapshots and beacon liveness
//! - [`transport`]: best-effort inter-MDS message transport
//! - [`migrate`]: the Migrator — export/import state machines, bystander
//!   handling, failure recovery
//! - [`node`]: the single-task event loop tying the layers together
//! - [`balancer`]: load-accounting call-outs consumed by the Migrator

pub mod balancer;
pub mod cache;
pub mod config;
pub mod journal;
pub mod mdsmap;
pub mod migrate;
pub mod node;
pub mod transport;

#[cfg(test)]
pub(crate) mod harness;

pub use balancer::Balancer;
pub use config::MdsConfig;
pub use journal::{Journal, JournalEvent, SubtreeOutcome};
pub use mdsmap::{BeaconMonitor, MdsMap, MdsMapHandle, MdsState};
pub use migrate::{
    ExportPhase, ImportPhase, MigrationMessage, Migrator, MigratorCtx,
};
pub use node::{MdsNode, NodeEvent};
pub use transport::{Envelope, QueueTransport, Transport};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
