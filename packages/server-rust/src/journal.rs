//! Write-ahead journal for migration events.
//!
//! The journal is the durability contract of the migration protocol: the
//! exporter's `Export` event is durable before `EXPORT-FINISH` is sent, the
//! importer's `ImportStart` is durable before the `EXPORT-ACK`, and the
//! importer writes `ImportFinish` (committed or aborted) when the protocol
//! resolves. Replaying the durable sequence after a restart reconstructs
//! exactly the authority the protocol had committed to.
//!
//! Submission is asynchronous: `submit_entry` queues the event and returns a
//! sequence number; durability is reported when the pending entry is flushed
//! (through the node loop, which invokes the continuation registered for
//! that sequence number). Events are MsgPack-encoded back-to-back in the
//! backing file; the in-memory journal is identical minus the file.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use grove_core::DirId;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One durable migration event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalEvent {
    /// Exporter: the importer acked the bulk payload; the subtree has left
    /// this rank.
    Export { root: DirId, bounds: Vec<DirId> },
    /// Importer: bulk data integrated; the import is tentatively ours.
    ImportStart { root: DirId, bounds: Vec<DirId> },
    /// Importer: the import resolved. `committed = false` records a reverse.
    ImportFinish { root: DirId, committed: bool },
}

impl JournalEvent {
    #[must_use]
    pub fn root(&self) -> DirId {
        match self {
            JournalEvent::Export { root, .. }
            | JournalEvent::ImportStart { root, .. }
            | JournalEvent::ImportFinish { root, .. } => *root,
        }
    }
}

/// Outcome for one subtree after folding the durable event sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubtreeOutcome {
    /// We exported it; authority lies with the importer.
    Exported,
    /// We imported it and committed; authority is ours.
    ImportCommitted,
    /// We imported it and reversed; authority stayed with the exporter.
    ImportAborted,
    /// `ImportStart` with no `ImportFinish`: resolution requires the
    /// cluster-wide import-map exchange.
    ImportAmbiguous,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal io: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal entry decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("journal entry encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Append-only journal with deferred durability.
pub struct Journal {
    next_seq: u64,
    pending: VecDeque<(u64, JournalEvent)>,
    durable: Vec<JournalEvent>,
    sink: Option<File>,
}

impl Journal {
    /// A journal with no backing file. Durability is still deferred through
    /// the pending queue; only the bytes never reach disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            next_seq: 1,
            pending: VecDeque::new(),
            durable: Vec::new(),
            sink: None,
        }
    }

    /// Opens (or creates) a file-backed journal, loading any events already
    /// durable from a previous incarnation.
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let durable = match File::open(path) {
            Ok(mut file) => read_events(&mut file)?,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let sink = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            next_seq: 1,
            pending: VecDeque::new(),
            durable,
            sink: Some(sink),
        })
    }

    /// Queues an event for durability and returns its sequence number. The
    /// caller registers a continuation under that number; it fires when the
    /// flush completes.
    pub fn submit_entry(&mut self, event: JournalEvent) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        tracing::debug!(seq, root = %event.root(), "journal submit");
        self.pending.push_back((seq, event));
        seq
    }

    /// Makes the oldest pending entry durable. Returns its sequence number,
    /// or `None` if nothing is pending.
    pub fn flush_next(&mut self) -> Result<Option<u64>, JournalError> {
        let Some((seq, event)) = self.pending.pop_front() else {
            return Ok(None);
        };
        if let Some(sink) = self.sink.as_mut() {
            rmp_serde::encode::write_named(sink, &event)?;
        }
        self.durable.push(event);
        Ok(Some(seq))
    }

    /// Flushes every pending entry, oldest first.
    pub fn flush_all(&mut self) -> Result<Vec<u64>, JournalError> {
        let mut seqs = Vec::new();
        while let Some(seq) = self.flush_next()? {
            seqs.push(seq);
        }
        Ok(seqs)
    }

    /// Number of entries submitted but not yet durable.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The durable event sequence, oldest first.
    #[must_use]
    pub fn durable_events(&self) -> &[JournalEvent] {
        &self.durable
    }

    /// Folds the durable sequence into a per-subtree outcome. Later events
    /// override earlier ones for the same root, so a subtree that bounced
    /// between ranks resolves to its final committed state.
    #[must_use]
    pub fn replay(&self) -> HashMap<DirId, SubtreeOutcome> {
        replay_events(&self.durable)
    }
}

/// Replays an arbitrary durable sequence (exposed for restart recovery).
#[must_use]
pub fn replay_events(events: &[JournalEvent]) -> HashMap<DirId, SubtreeOutcome> {
    let mut outcomes = HashMap::new();
    for event in events {
        match event {
            JournalEvent::Export { root, .. } => {
                outcomes.insert(*root, SubtreeOutcome::Exported);
            }
            JournalEvent::ImportStart { root, .. } => {
                outcomes.insert(*root, SubtreeOutcome::ImportAmbiguous);
            }
            JournalEvent::ImportFinish { root, committed } => {
                let outcome = if *committed {
                    SubtreeOutcome::ImportCommitted
                } else {
                    SubtreeOutcome::ImportAborted
                };
                outcomes.insert(*root, outcome);
            }
        }
    }
    outcomes
}

fn read_events(file: &mut File) -> Result<Vec<JournalEvent>, JournalError> {
    let mut events = Vec::new();
    loop {
        match rmp_serde::decode::from_read(&mut *file) {
            Ok(event) => events.push(event),
            Err(rmp_serde::decode::Error::InvalidMarkerRead(err))
                if err.kind() == ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(events)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn export(root: u64) -> JournalEvent {
        JournalEvent::Export {
            root: DirId(root),
            bounds: vec![DirId(root + 1)],
        }
    }

    #[test]
    fn submit_is_not_durable_until_flushed() {
        let mut journal = Journal::in_memory();
        let seq = journal.submit_entry(export(0x10));
        assert_eq!(journal.pending_len(), 1);
        assert!(journal.durable_events().is_empty());

        let flushed = journal.flush_next().unwrap();
        assert_eq!(flushed, Some(seq));
        assert_eq!(journal.pending_len(), 0);
        assert_eq!(journal.durable_events().len(), 1);
    }

    #[test]
    fn flush_all_preserves_submission_order() {
        let mut journal = Journal::in_memory();
        let first = journal.submit_entry(export(0x10));
        let second = journal.submit_entry(JournalEvent::ImportStart {
            root: DirId(0x20),
            bounds: vec![],
        });
        let seqs = journal.flush_all().unwrap();
        assert_eq!(seqs, vec![first, second]);
        assert_eq!(journal.durable_events()[0].root(), DirId(0x10));
        assert_eq!(journal.durable_events()[1].root(), DirId(0x20));
    }

    #[test]
    fn replay_resolves_committed_import() {
        let events = vec![
            JournalEvent::ImportStart {
                root: DirId(0x10),
                bounds: vec![],
            },
            JournalEvent::ImportFinish {
                root: DirId(0x10),
                committed: true,
            },
        ];
        let outcomes = replay_events(&events);
        assert_eq!(
            outcomes.get(&DirId(0x10)),
            Some(&SubtreeOutcome::ImportCommitted)
        );
    }

    #[test]
    fn replay_leaves_unfinished_import_ambiguous() {
        let events = vec![JournalEvent::ImportStart {
            root: DirId(0x10),
            bounds: vec![],
        }];
        let outcomes = replay_events(&events);
        assert_eq!(
            outcomes.get(&DirId(0x10)),
            Some(&SubtreeOutcome::ImportAmbiguous)
        );
    }

    #[test]
    fn replay_records_aborted_import() {
        let events = vec![
            JournalEvent::ImportStart {
                root: DirId(0x10),
                bounds: vec![],
            },
            JournalEvent::ImportFinish {
                root: DirId(0x10),
                committed: false,
            },
        ];
        let outcomes = replay_events(&events);
        assert_eq!(
            outcomes.get(&DirId(0x10)),
            Some(&SubtreeOutcome::ImportAborted)
        );
    }

    #[test]
    fn replay_uses_latest_event_per_root() {
        // Imported, committed, then exported away again.
        let events = vec![
            JournalEvent::ImportStart {
                root: DirId(0x10),
                bounds: vec![],
            },
            JournalEvent::ImportFinish {
                root: DirId(0x10),
                committed: true,
            },
            JournalEvent::Export {
                root: DirId(0x10),
                bounds: vec![],
            },
        ];
        let outcomes = replay_events(&events);
        assert_eq!(outcomes.get(&DirId(0x10)), Some(&SubtreeOutcome::Exported));
    }

    #[test]
    fn file_backed_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.bin");

        {
            let mut journal = Journal::open(&path).unwrap();
            journal.submit_entry(export(0x10));
            journal.submit_entry(JournalEvent::ImportFinish {
                root: DirId(0x20),
                committed: true,
            });
            journal.flush_all().unwrap();
            // A pending entry that never flushed must not survive.
            journal.submit_entry(export(0x30));
        }

        let reopened = Journal::open(&path).unwrap();
        assert_eq!(reopened.durable_events().len(), 2);
        assert_eq!(reopened.durable_events()[0], export(0x10));
        let outcomes = reopened.replay();
        assert_eq!(outcomes.get(&DirId(0x10)), Some(&SubtreeOutcome::Exported));
        assert_eq!(outcomes.get(&DirId(0x30)), None);
    }
}
