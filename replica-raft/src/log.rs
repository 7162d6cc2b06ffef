//! Replicated Log
//!
//! This module defines the log entry format, the durable log store contract
//! the consensus context writes through, and an in-memory store used for
//! tests and ephemeral nodes.

use replica_core::{LogIndex, MemberId, ReplicaError, Result, Roster, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// Payload carried by a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a new leader to commit entries from earlier terms
    Noop,
    /// Opaque client command for the state machine
    Command(Vec<u8>),
    /// Membership change: the complete roster that takes effect on commit
    Membership(Roster),
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when the entry was received by the leader
    pub term: Term,
    /// The index of this entry in the log
    pub index: LogIndex,
    /// What the entry carries
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, payload: EntryPayload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }
}

/// State that must survive a restart before the node may rejoin the protocol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<MemberId>,
    /// Lower bound on the commit index, saved opportunistically
    pub commit: LogIndex,
}

/// Describes the log prefix a snapshot replaces
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// The last log index included in the snapshot
    pub last_included_index: LogIndex,
    /// The term of that entry
    pub last_included_term: Term,
    /// The roster in effect at that index
    pub roster: Roster,
}

/// Snapshot of the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    /// The snapshot data produced by the state machine
    pub data: Vec<u8>,
}

/// Durable append-only log storage.
///
/// The consensus context is the only writer. Entries below the snapshot
/// boundary are no longer retrievable individually; `first_index` reports the
/// lowest index still held.
pub trait LogStore: Send {
    /// Persisted term, vote and commit lower bound
    fn hard_state(&self) -> HardState;

    /// Durably replace the hard state
    fn save_hard_state(&mut self, state: &HardState) -> Result<()>;

    /// Append entries. `entries[0].index` must be `last_index() + 1`.
    fn append(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Remove the entry at `index` and every entry after it
    fn truncate_from(&mut self, index: LogIndex) -> Result<()>;

    /// Entry at `index`, if held
    fn get(&self, index: LogIndex) -> Option<LogEntry>;

    /// Entries in `[from, to)`, clipped to what the store holds
    fn entries(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry>;

    /// Lowest index still held as an individual entry
    fn first_index(&self) -> LogIndex;

    /// Highest index in the log, or the snapshot boundary if the log is empty
    fn last_index(&self) -> LogIndex;

    /// Durability barrier; appended entries count toward a quorum only after it
    fn flush(&mut self) -> Result<()>;

    /// Metadata of the latest snapshot, if any
    fn snapshot_meta(&self) -> Option<SnapshotMeta>;

    /// The latest snapshot, if any
    fn snapshot(&self) -> Option<Snapshot>;

    /// Store a snapshot taken locally and discard entries it covers
    fn compact(&mut self, snapshot: Snapshot) -> Result<()>;

    /// Store a snapshot received from the leader. Entries after the snapshot
    /// are kept only if the log agrees with it at its boundary.
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()>;

    /// Term of the last entry, or of the snapshot boundary
    fn last_term(&self) -> Term {
        self.term_at(self.last_index()).unwrap_or(0)
    }

    /// Term of the entry at `index`, answering for the snapshot boundary too
    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if let Some(meta) = self.snapshot_meta() {
            if index == meta.last_included_index {
                return Some(meta.last_included_term);
            }
            if index < meta.last_included_index {
                return None;
            }
        }
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// Index of the snapshot boundary, 0 if no snapshot
    fn snapshot_index(&self) -> LogIndex {
        self.snapshot_meta()
            .map(|m| m.last_included_index)
            .unwrap_or(0)
    }
}

/// In-memory log store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryLogStore {
    hard_state: HardState,
    entries: VecDeque<LogEntry>,
    snapshot: Option<Snapshot>,
}

impl MemoryLogStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn base_index(&self) -> LogIndex {
        self.snapshot
            .as_ref()
            .map(|s| s.meta.last_included_index + 1)
            .unwrap_or(1)
    }

    fn position(&self, index: LogIndex) -> Option<usize> {
        let base = self.base_index();
        if index < base {
            return None;
        }
        let pos = (index - base) as usize;
        (pos < self.entries.len()).then_some(pos)
    }

    /// Number of entries held (excluding the snapshot)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LogStore for MemoryLogStore {
    fn hard_state(&self) -> HardState {
        self.hard_state.clone()
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let expected = self.last_index() + 1;
        if first.index != expected {
            return Err(ReplicaError::Storage(format!(
                "Non-contiguous append: expected index {}, got {}",
                expected, first.index
            )));
        }
        debug!("Appending {} entries at index {}", entries.len(), first.index);
        self.entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index < self.base_index() {
            return Err(ReplicaError::Storage(format!(
                "Cannot truncate at {} below snapshot boundary {}",
                index,
                self.base_index()
            )));
        }
        if let Some(pos) = self.position(index) {
            self.entries.truncate(pos);
            debug!("Truncated log from index {}", index);
        }
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Option<LogEntry> {
        self.position(index).and_then(|p| self.entries.get(p)).cloned()
    }

    fn entries(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        let base = self.base_index();
        let from = from.max(base);
        let to = to.min(self.last_index() + 1);
        if from >= to {
            return Vec::new();
        }
        let start = (from - base) as usize;
        let end = (to - base) as usize;
        self.entries.range(start..end).cloned().collect()
    }

    fn first_index(&self) -> LogIndex {
        self.base_index()
    }

    fn last_index(&self) -> LogIndex {
        self.base_index() - 1 + self.entries.len() as LogIndex
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn snapshot_meta(&self) -> Option<SnapshotMeta> {
        self.snapshot.as_ref().map(|s| s.meta.clone())
    }

    fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot.clone()
    }

    fn compact(&mut self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.meta.last_included_index;
        if index > self.last_index() {
            return Err(ReplicaError::Storage(format!(
                "Cannot compact through {} beyond last index {}",
                index,
                self.last_index()
            )));
        }
        if index < self.base_index() {
            return Ok(());
        }
        let remove = (index - self.base_index() + 1) as usize;
        self.entries.drain(..remove);
        self.snapshot = Some(snapshot);
        debug!("Compacted log through index {}", index);
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let meta = &snapshot.meta;
        let keeps_suffix = self.term_at(meta.last_included_index) == Some(meta.last_included_term)
            && meta.last_included_index >= self.base_index();
        if keeps_suffix {
            let remove = (meta.last_included_index - self.base_index() + 1) as usize;
            self.entries.drain(..remove);
        } else {
            self.entries.clear();
        }
        debug!(
            "Installed snapshot at index {} (kept {} entries)",
            meta.last_included_index,
            self.entries.len()
        );
        self.snapshot = Some(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_core::Member;

    fn command(term: Term, index: LogIndex, byte: u8) -> LogEntry {
        LogEntry::new(term, index, EntryPayload::Command(vec![byte]))
    }

    fn snapshot_at(index: LogIndex, term: Term) -> Snapshot {
        Snapshot {
            meta: SnapshotMeta {
                last_included_index: index,
                last_included_term: term,
                roster: Roster::new([Member::new("node1", "127.0.0.1:7001")]),
            },
            data: vec![10, 20, 30],
        }
    }

    #[test]
    fn test_empty_log() {
        let log = MemoryLogStore::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.term_at(0), Some(0));
        assert!(log.is_empty());
    }

    #[test]
    fn test_append_entries() {
        let mut log = MemoryLogStore::new();
        log.append(&[command(1, 1, 1), command(1, 2, 2)]).unwrap();

        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_append_rejects_gap() {
        let mut log = MemoryLogStore::new();
        log.append(&[command(1, 1, 1)]).unwrap();
        let err = log.append(&[command(1, 3, 3)]).unwrap_err();
        assert!(matches!(err, ReplicaError::Storage(_)));
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn test_get_entry() {
        let mut log = MemoryLogStore::new();
        log.append(&[command(1, 1, 7)]).unwrap();

        let entry = log.get(1).unwrap();
        assert_eq!(entry.index, 1);
        assert_eq!(entry.payload, EntryPayload::Command(vec![7]));
        assert!(log.get(0).is_none());
        assert!(log.get(2).is_none());
    }

    #[test]
    fn test_truncate() {
        let mut log = MemoryLogStore::new();
        log.append(&[command(1, 1, 1), command(1, 2, 2), command(2, 3, 3)])
            .unwrap();

        log.truncate_from(2).unwrap();

        assert_eq!(log.last_index(), 1);
        assert_eq!(log.len(), 1);
        assert!(log.get(2).is_none());
        assert!(log.get(1).is_some());
        log.append(&[command(3, 2, 9)]).unwrap();
        assert_eq!(log.last_term(), 3);
    }

    #[test]
    fn test_entries_range() {
        let mut log = MemoryLogStore::new();
        log.append(&[command(1, 1, 1), command(1, 2, 2), command(1, 3, 3)])
            .unwrap();

        let entries = log.entries(2, 10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 2);
        assert_eq!(entries[1].index, 3);
        assert!(log.entries(4, 10).is_empty());
        assert_eq!(log.entries(1, 2).len(), 1);
    }

    #[test]
    fn test_compact() {
        let mut log = MemoryLogStore::new();
        log.append(&[command(1, 1, 1), command(1, 2, 2), command(2, 3, 3)])
            .unwrap();

        log.compact(snapshot_at(2, 1)).unwrap();

        assert_eq!(log.last_index(), 3);
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.len(), 1);
        assert_eq!(log.snapshot_index(), 2);
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.term_at(1), None);
        assert!(log.get(1).is_none());
        assert!(log.get(3).is_some());
        assert!(log.truncate_from(2).is_err());
    }

    #[test]
    fn test_compact_whole_log_keeps_last_term() {
        let mut log = MemoryLogStore::new();
        log.append(&[command(1, 1, 1), command(4, 2, 2)]).unwrap();
        log.compact(snapshot_at(2, 4)).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 4);
        log.append(&[command(5, 3, 3)]).unwrap();
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn test_install_snapshot_discards_conflicting_log() {
        let mut log = MemoryLogStore::new();
        log.append(&[command(1, 1, 1), command(1, 2, 2)]).unwrap();
        log.install_snapshot(snapshot_at(5, 3)).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.last_term(), 3);
    }

    #[test]
    fn test_install_snapshot_keeps_matching_suffix() {
        let mut log = MemoryLogStore::new();
        log.append(&[command(1, 1, 1), command(2, 2, 2), command(2, 3, 3)])
            .unwrap();
        log.install_snapshot(snapshot_at(2, 2)).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.snapshot().unwrap().data, vec![10, 20, 30]);
    }

    #[test]
    fn test_hard_state_round_trip() {
        let mut log = MemoryLogStore::new();
        let state = HardState {
            term: 4,
            voted_for: Some(MemberId::from("node2")),
            commit: 3,
        };
        log.save_hard_state(&state).unwrap();
        assert_eq!(log.hard_state(), state);
    }
}
