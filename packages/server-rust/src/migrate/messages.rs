//! Inter-MDS migration wire messages.
//!
//! These messages are exchanged between MDS ranks over dedicated inter-node
//! connections, separate from client traffic. They use MsgPack serialization
//! (`rmp_serde::to_vec_named()`). Every message is tagged with the inode
//! identifier of the subtree root it concerns, so handlers can match it
//! against the in-flight record (or discard it if the record is gone).

use serde::{Deserialize, Serialize};

use grove_core::{Authority, BoundTrace, DirDiscover, DirId, InodeId, MdsId};

// ---------------------------------------------------------------------------
// MigrationMessage enum (9 variants)
// ---------------------------------------------------------------------------

/// Top-level migration protocol message.
///
/// Internally tagged on `"type"` with `SCREAMING_SNAKE_CASE` variant names.
/// Covers the exporter/importer handshake (7) and the bystander notify
/// pair (2). The first notify announces the will-be authority pair before
/// the bulk transfer; the second announces the resolved new authority after
/// the exporter's journal commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationMessage {
    // -- Exporter <-> importer (7) -----------------------------------------
    ExportDiscover(ExportDiscoverPayload),
    ExportDiscoverAck(ExportDiscoverAckPayload),
    ExportPrep(ExportPrepPayload),
    ExportPrepAck(ExportPrepAckPayload),
    Export(ExportPayloadMsg),
    ExportAck(ExportAckPayload),
    ExportFinish(ExportFinishPayload),

    // -- Bystander notifications (2) ---------------------------------------
    ExportNotify(ExportNotifyPayload),
    ExportNotifyAck(ExportNotifyAckPayload),
}

impl MigrationMessage {
    /// The subtree root this message is tagged with.
    #[must_use]
    pub fn root(&self) -> DirId {
        match self {
            MigrationMessage::ExportDiscover(p) => p.root,
            MigrationMessage::ExportDiscoverAck(p) => p.root,
            MigrationMessage::ExportPrep(p) => p.root,
            MigrationMessage::ExportPrepAck(p) => p.root,
            MigrationMessage::Export(p) => p.root,
            MigrationMessage::ExportAck(p) => p.root,
            MigrationMessage::ExportFinish(p) => p.root,
            MigrationMessage::ExportNotify(p) => p.root,
            MigrationMessage::ExportNotifyAck(p) => p.root,
        }
    }

    /// Short name for log lines.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MigrationMessage::ExportDiscover(_) => "EXPORT-DISCOVER",
            MigrationMessage::ExportDiscoverAck(_) => "EXPORT-DISCOVER-ACK",
            MigrationMessage::ExportPrep(_) => "EXPORT-PREP",
            MigrationMessage::ExportPrepAck(_) => "EXPORT-PREP-ACK",
            MigrationMessage::Export(_) => "EXPORT",
            MigrationMessage::ExportAck(_) => "EXPORT-ACK",
            MigrationMessage::ExportFinish(_) => "EXPORT-FINISH",
            MigrationMessage::ExportNotify(_) => "EXPORT-NOTIFY",
            MigrationMessage::ExportNotifyAck(_) => "EXPORT-NOTIFY-ACK",
        }
    }
}

// ---------------------------------------------------------------------------
// Exporter <-> importer payloads
// ---------------------------------------------------------------------------

/// Opens the handshake: asks the destination to fetch the subtree root's
/// inode and agree to receive the region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDiscoverPayload {
    pub root: DirId,
    /// Enough for the destination to instantiate the root if it has never
    /// replicated it.
    pub discover: DirDiscover,
}

/// Destination accepted the discover; the exporter may begin freezing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDiscoverAckPayload {
    pub root: DirId,
}

/// Describes the frozen region: bounds, spanning context, and the bystanders
/// the exporter will keep consistent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPrepPayload {
    pub root: DirId,
    pub root_discover: DirDiscover,
    /// Inode identifiers of the bound directories, announced before the
    /// importer has opened them.
    pub bound_inos: Vec<InodeId>,
    /// Per-bound inode traces and directory discover records so the importer
    /// can reconstitute the spanning context before bulk data arrives.
    pub traces: Vec<BoundTrace>,
    pub bystanders: Vec<MdsId>,
}

/// Importer finished assembling the spanning context and froze the region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPrepAckPayload {
    pub root: DirId,
}

/// The bulk subtree payload: an encoded [`grove_core::ExportPayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPayloadMsg {
    pub root: DirId,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Importer has integrated the bulk data and journaled `EImportStart`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportAckPayload {
    pub root: DirId,
}

/// Exporter's `EExport` is durable and all bystanders acked; the importer
/// may commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportFinishPayload {
    pub root: DirId,
}

// ---------------------------------------------------------------------------
// Bystander payloads
// ---------------------------------------------------------------------------

/// Authority-change notification to a bystander. Carries the full old and
/// new pairs plus the bounds, so the handler is stateless across the two
/// notifies of a migration (and across an importer's abort notify).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportNotifyPayload {
    pub root: DirId,
    pub was: Authority,
    pub now: Authority,
    pub bounds: Vec<DirId>,
}

/// Bystander acknowledgment of a notify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportNotifyAckPayload {
    pub root: DirId,
}
