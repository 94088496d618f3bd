//! Migration record types: per-phase state for both protocol roles.
//!
//! Each state variant carries exactly the fields that phase needs — the
//! buffered payload exists only while `EXPORTING` awaits its ack, the
//! pending-ack sets exist only while a notify round is outstanding — so an
//! illegal combination (acking a payload that was never sent, reversing a
//! buffer that was already dropped) cannot be represented.

use std::collections::BTreeSet;

use bytes::Bytes;
use tokio::sync::oneshot;

use grove_core::{DirId, InodeId, MdsId};

// ---------------------------------------------------------------------------
// Export side
// ---------------------------------------------------------------------------

/// Phase tag for an export in progress (log lines, assertions, tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportPhase {
    Discovering,
    Freezing,
    Prepping,
    Warning,
    Exporting,
    LoggingFinish,
    Notifying,
}

/// State of one outbound migration, keyed by the subtree root.
#[derive(Debug)]
pub enum ExportState {
    /// `EXPORT-DISCOVER` sent; an auth-pin holds the root until the peer
    /// accepts.
    Discovering,
    /// Peer accepted; the subtree is quiescing. Advanced by the freeze
    /// completion, not by a message.
    Freezing,
    /// `EXPORT-PREP` sent; bounds are captured and pinned.
    Prepping {
        bounds: BTreeSet<DirId>,
        bystanders: BTreeSet<MdsId>,
    },
    /// First notify round: bystanders are being told authority will change.
    Warning {
        bounds: BTreeSet<DirId>,
        bystanders: BTreeSet<MdsId>,
        warning_acks_pending: BTreeSet<MdsId>,
    },
    /// Bulk payload sent; buffered here untouched until the importer acks,
    /// so a failed export can be decoded straight back into the cache.
    Exporting {
        bounds: BTreeSet<DirId>,
        bystanders: BTreeSet<MdsId>,
        encoded: Bytes,
    },
    /// Importer acked; the `Export` journal event is in flight.
    LoggingFinish {
        bounds: BTreeSet<DirId>,
        bystanders: BTreeSet<MdsId>,
    },
    /// Second notify round: bystanders learn the resolved new authority.
    Notifying {
        bounds: BTreeSet<DirId>,
        notify_acks_pending: BTreeSet<MdsId>,
    },
}

impl ExportState {
    #[must_use]
    pub fn phase(&self) -> ExportPhase {
        match self {
            ExportState::Discovering => ExportPhase::Discovering,
            ExportState::Freezing => ExportPhase::Freezing,
            ExportState::Prepping { .. } => ExportPhase::Prepping,
            ExportState::Warning { .. } => ExportPhase::Warning,
            ExportState::Exporting { .. } => ExportPhase::Exporting,
            ExportState::LoggingFinish { .. } => ExportPhase::LoggingFinish,
            ExportState::Notifying { .. } => ExportPhase::Notifying,
        }
    }
}

/// Continuation queued by a caller awaiting an export's termination.
/// Resolved with `true` when the subtree migrated, `false` on unwind.
pub type FinishWaiter = oneshot::Sender<bool>;

/// One outbound migration.
#[derive(Debug)]
pub struct ExportRecord {
    pub peer: MdsId,
    pub state: ExportState,
    pub finish_waiters: Vec<FinishWaiter>,
}

impl ExportRecord {
    #[must_use]
    pub fn new(peer: MdsId) -> Self {
        Self {
            peer,
            state: ExportState::Discovering,
            finish_waiters: Vec::new(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> ExportPhase {
        self.state.phase()
    }
}

// ---------------------------------------------------------------------------
// Import side
// ---------------------------------------------------------------------------

/// Phase tag for an import in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportPhase {
    Discovered,
    Prepping,
    Prepped,
    LoggingStart,
    Acking,
    Aborting,
}

/// State of one inbound migration, keyed by the root's inode identifier.
#[derive(Debug)]
pub enum ImportState {
    /// Root inode pinned in cache; ready for `EXPORT-PREP`.
    Discovered,
    /// Assembling the spanning context; may be suspended on remote
    /// directory opens.
    Prepping {
        bound_inos: Vec<InodeId>,
        /// Bounds whose directory open has not completed yet.
        pending_opens: BTreeSet<DirId>,
        /// Bounds already resolved and pinned.
        bounds: BTreeSet<DirId>,
        bystanders: BTreeSet<MdsId>,
    },
    /// Context complete, region frozen, ambiguous authority asserted,
    /// `EXPORT-PREP-ACK` sent.
    Prepped {
        bounds: BTreeSet<DirId>,
        bystanders: BTreeSet<MdsId>,
    },
    /// Bulk data integrated; the `ImportStart` journal event is in flight.
    LoggingStart {
        bounds: BTreeSet<DirId>,
        bystanders: BTreeSet<MdsId>,
    },
    /// `EXPORT-ACK` sent; awaiting `EXPORT-FINISH`.
    Acking {
        bounds: BTreeSet<DirId>,
        bystanders: BTreeSet<MdsId>,
    },
    /// Unwinding: bystanders are being told the import aborted. Terminal
    /// when the last ack arrives.
    Aborting {
        notify_acks_pending: BTreeSet<MdsId>,
    },
}

impl ImportState {
    #[must_use]
    pub fn phase(&self) -> ImportPhase {
        match self {
            ImportState::Discovered => ImportPhase::Discovered,
            ImportState::Prepping { .. } => ImportPhase::Prepping,
            ImportState::Prepped { .. } => ImportPhase::Prepped,
            ImportState::LoggingStart { .. } => ImportPhase::LoggingStart,
            ImportState::Acking { .. } => ImportPhase::Acking,
            ImportState::Aborting { .. } => ImportPhase::Aborting,
        }
    }
}

/// One inbound migration.
#[derive(Debug)]
pub struct ImportRecord {
    pub peer: MdsId,
    pub state: ImportState,
}

impl ImportRecord {
    #[must_use]
    pub fn new(peer: MdsId) -> Self {
        Self {
            peer,
            state: ImportState::Discovered,
        }
    }

    #[must_use]
    pub fn phase(&self) -> ImportPhase {
        self.state.phase()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
