//! Balancer call-out surface.
//!
//! The balancer decides *which* subtrees migrate and *where*; the Migrator
//! executes. The only coupling the Migrator has back to it is load
//! accounting: a subtree's load leaves this rank's books just before the
//! bulk export, and lands on the importer's books when an import commits.

use std::collections::HashSet;

use grove_core::DirId;

/// Per-rank load accounting for migrated subtrees.
#[derive(Debug, Default)]
pub struct Balancer {
    owned: HashSet<DirId>,
    exports_started: u64,
    imports_finished: u64,
}

impl Balancer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a subtree this rank already owns (startup / replay).
    pub fn note_owned(&mut self, root: DirId) {
        self.owned.insert(root);
    }

    /// Called by the Migrator just before the bulk payload leaves: the
    /// subtree's load no longer counts against this rank.
    pub fn subtract_export(&mut self, root: DirId) {
        self.owned.remove(&root);
        self.exports_started += 1;
    }

    /// Called by the Migrator when an import commits: the subtree's load
    /// counts here now.
    pub fn add_import(&mut self, root: DirId) {
        self.owned.insert(root);
        self.imports_finished += 1;
    }

    #[must_use]
    pub fn owns(&self, root: DirId) -> bool {
        self.owned.contains(&root)
    }

    #[must_use]
    pub fn exports_started(&self) -> u64 {
        self.exports_started
    }

    #[must_use]
    pub fn imports_finished(&self) -> u64 {
        self.imports_finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_then_import_moves_ownership() {
        let mut balancer = Balancer::new();
        balancer.note_owned(DirId(0x10));
        assert!(balancer.owns(DirId(0x10)));

        balancer.subtract_export(DirId(0x10));
        assert!(!balancer.owns(DirId(0x10)));
        assert_eq!(balancer.exports_started(), 1);

        balancer.add_import(DirId(0x10));
        assert!(balancer.owns(DirId(0x10)));
        assert_eq!(balancer.imports_finished(), 1);
    }
}
