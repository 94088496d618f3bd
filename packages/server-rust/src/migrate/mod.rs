//! Subtree migration protocol module.
//!
//! Provides the wire messages, per-phase record types, the subtree codec,
//! the export/import state machines with bystander handling, and the
//! peer-failure handler for the inter-MDS migration protocol.

pub mod codec;
mod failure;
pub mod messages;
pub mod migrator;
pub mod types;

// ---------------------------------------------------------------------------
// Re-exports — flat public API
// ---------------------------------------------------------------------------

// messages
pub use messages::{
    ExportAckPayload, ExportDiscoverAckPayload, ExportDiscoverPayload, ExportFinishPayload,
    ExportNotifyAckPayload, ExportNotifyPayload, ExportPayloadMsg, ExportPrepAckPayload,
    ExportPrepPayload, MigrationMessage,
};

// types
pub use types::{
    ExportPhase, ExportRecord, ExportState, FinishWaiter, ImportPhase, ImportRecord, ImportState,
};

// codec
pub use codec::{decode_subtree, encode_subtree, strip_imported_region};

// migrator
pub use migrator::{Migrator, MigratorCtx};

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------
