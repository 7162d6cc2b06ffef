//! File-backed log storage for replica nodes
//!
//! A data directory holds three files:
//! - `hard_state.json`: current term, vote and commit lower bound
//! - `snapshot.bin`: latest snapshot (metadata, roster and state machine image)
//! - `log.bin`: log entries after the snapshot, as length-prefixed bincode
//!   records appended in index order
//!
//! The hard state and snapshot are replaced atomically (write to a temp file,
//! sync, rename). The log is append-only; `flush` is the durability barrier.
//! A torn record at the tail of the log (crash mid-append) is discarded on
//! open.

use replica_core::{LogIndex, ReplicaError, Result};
use replica_raft::{HardState, LogEntry, LogStore, Snapshot, SnapshotMeta};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const HARD_STATE_FILE: &str = "hard_state.json";
const SNAPSHOT_FILE: &str = "snapshot.bin";
const LOG_FILE: &str = "log.bin";

/// Size of the length prefix in front of every log record
const RECORD_HEADER: usize = 4;

fn storage_error(context: &str) -> impl FnOnce(io::Error) -> ReplicaError + '_ {
    move |e| ReplicaError::Storage(format!("{}: {}", context, e))
}

/// Write `bytes` to `path` so that readers see either the old or the new
/// contents, never a mix
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    if let Some(dir) = path.parent() {
        // Persist the rename itself. Not every platform can open a directory.
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn encode_record(entry: &LogEntry, out: &mut Vec<u8>) -> Result<()> {
    let body = bincode::serialize(entry)?;
    let len = u32::try_from(body.len()).map_err(|_| {
        ReplicaError::Storage(format!("Entry {} is too large to store", entry.index))
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

/// Decode every complete record in `bytes`. Returns the entries, the file
/// offset of each, and the length of the valid prefix.
fn decode_records(bytes: &[u8]) -> (Vec<LogEntry>, Vec<u64>, usize) {
    let mut entries = Vec::new();
    let mut offsets = Vec::new();
    let mut pos = 0;

    while pos + RECORD_HEADER <= bytes.len() {
        let mut header = [0u8; RECORD_HEADER];
        header.copy_from_slice(&bytes[pos..pos + RECORD_HEADER]);
        let len = u32::from_le_bytes(header) as usize;
        let start = pos + RECORD_HEADER;
        if start + len > bytes.len() {
            break;
        }
        let entry: LogEntry = match bincode::deserialize(&bytes[start..start + len]) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Undecodable log record at offset {}: {}", pos, e);
                break;
            }
        };
        offsets.push(pos as u64);
        entries.push(entry);
        pos = start + len;
    }

    (entries, offsets, pos)
}

/// Durable [`LogStore`] kept in a directory on the local filesystem
pub struct FileLogStore {
    dir: PathBuf,
    log: File,
    /// Bytes of valid records in `log.bin`
    log_len: u64,
    hard_state: HardState,
    snapshot: Option<Snapshot>,
    /// Entries after the snapshot, with the file offset of each record
    entries: VecDeque<LogEntry>,
    offsets: VecDeque<u64>,
}

impl FileLogStore {
    /// Open the store in `dir`, creating it if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        info!("Opening log store at {}", dir.display());
        fs::create_dir_all(&dir).map_err(storage_error("Failed to create data directory"))?;

        let hard_state = Self::load_hard_state(&dir)?;
        let snapshot = Self::load_snapshot(&dir)?;
        let base = snapshot
            .as_ref()
            .map(|s| s.meta.last_included_index + 1)
            .unwrap_or(1);

        let log_path = dir.join(LOG_FILE);
        let mut bytes = Vec::new();
        if log_path.exists() {
            File::open(&log_path)
                .and_then(|mut f| f.read_to_end(&mut bytes))
                .map_err(storage_error("Failed to read log"))?;
        }
        let (loaded, loaded_offsets, valid) = decode_records(&bytes);
        if valid < bytes.len() {
            warn!(
                "Discarding {} bytes of torn log tail in {}",
                bytes.len() - valid,
                log_path.display()
            );
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(storage_error("Failed to open log"))?;
        log.set_len(valid as u64)
            .map_err(storage_error("Failed to trim log"))?;

        let mut store = Self {
            dir,
            log,
            log_len: valid as u64,
            hard_state,
            snapshot,
            entries: VecDeque::new(),
            offsets: VecDeque::new(),
        };

        // Records at or below the snapshot survive a crash between writing
        // the snapshot and rewriting the log. The suffix after them is kept
        // only if the log agreed with the snapshot at its boundary, the same
        // rule install_snapshot applied before the crash.
        let conflicting = store.snapshot.as_ref().is_some_and(|s| {
            loaded.iter().any(|e| {
                e.index == s.meta.last_included_index && e.term != s.meta.last_included_term
            })
        });
        if conflicting {
            warn!(
                "Log in {} disagrees with the snapshot at index {}, discarding entries after it",
                store.dir.display(),
                base - 1
            );
        }
        let mut stale = false;
        for (entry, offset) in loaded.into_iter().zip(loaded_offsets) {
            if entry.index < base || conflicting {
                stale = true;
                continue;
            }
            let expected = base + store.entries.len() as LogIndex;
            if entry.index != expected {
                return Err(ReplicaError::Storage(format!(
                    "Log is not contiguous: expected index {}, found {}",
                    expected, entry.index
                )));
            }
            store.entries.push_back(entry);
            store.offsets.push_back(offset);
        }
        if stale {
            store.rewrite_log()?;
        }

        info!(
            "Log store holds entries {}..={} at term {}",
            base,
            store.last_index(),
            store.hard_state.term
        );
        Ok(store)
    }

    /// Directory the store lives in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of entries held after the snapshot
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn load_hard_state(dir: &Path) -> Result<HardState> {
        let path = dir.join(HARD_STATE_FILE);
        if !path.exists() {
            return Ok(HardState::default());
        }
        let contents =
            fs::read_to_string(&path).map_err(storage_error("Failed to read hard state"))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn load_snapshot(dir: &Path) -> Result<Option<Snapshot>> {
        let path = dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(storage_error("Failed to read snapshot"))?;
        Ok(Some(bincode::deserialize(&bytes)?))
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

    fn save_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let bytes = bincode::serialize(&snapshot)?;
        write_atomic(&self.dir.join(SNAPSHOT_FILE), &bytes)
            .map_err(storage_error("Failed to write snapshot"))?;
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Replace `log.bin` with the entries currently held
    fn rewrite_log(&mut self) -> Result<()> {
        let mut bytes = Vec::new();
        let mut offsets = VecDeque::with_capacity(self.entries.len());
        for entry in &self.entries {
            offsets.push_back(bytes.len() as u64);
            encode_record(entry, &mut bytes)?;
        }

        let log_path = self.dir.join(LOG_FILE);
        write_atomic(&log_path, &bytes).map_err(storage_error("Failed to rewrite log"))?;
        self.log = OpenOptions::new()
            .append(true)
            .open(&log_path)
            .map_err(storage_error("Failed to reopen log"))?;
        self.log_len = bytes.len() as u64;
        self.offsets = offsets;
        debug!("Rewrote log with {} entries", self.entries.len());
        Ok(())
    }
}

impl LogStore for FileLogStore {
    fn hard_state(&self) -> HardState {
        self.hard_state.clone()
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.dir.join(HARD_STATE_FILE), &json)
            .map_err(storage_error("Failed to write hard state"))?;
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

        let mut bytes = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            offsets.push(self.log_len + bytes.len() as u64);
            encode_record(entry, &mut bytes)?;
        }
        if let Err(e) = self.log.write_all(&bytes) {
            // Drop whatever part of the write landed.
            let _ = self.log.set_len(self.log_len);
            return Err(storage_error("Failed to append to log")(e));
        }

        self.log_len += bytes.len() as u64;
        self.entries.extend(entries.iter().cloned());
        self.offsets.extend(offsets);
        debug!("Appended {} entries at index {}", entries.len(), first.index);
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
        let Some(pos) = self.position(index) else {
            return Ok(());
        };
        let offset = self.offsets[pos];
        self.log
            .set_len(offset)
            .and_then(|_| self.log.sync_data())
            .map_err(storage_error("Failed to truncate log"))?;
        self.log_len = offset;
        self.entries.truncate(pos);
        self.offsets.truncate(pos);
        debug!("Truncated log from index {}", index);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Option<LogEntry> {
        self.position(index)
            .and_then(|p| self.entries.get(p))
            .cloned()
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
        self.log
            .sync_data()
            .map_err(storage_error("Failed to sync log"))
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
        self.save_snapshot(snapshot)?;
        self.entries.drain(..remove);
        self.rewrite_log()?;
        info!("Compacted log through index {}", index);
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.meta.last_included_index;
        let keeps_suffix = index >= self.base_index()
            && self.term_at(index) == Some(snapshot.meta.last_included_term);
        let remove = if keeps_suffix {
            (index - self.base_index() + 1) as usize
        } else {
            self.entries.len()
        };

        self.save_snapshot(snapshot)?;
        self.entries.drain(..remove);
        self.rewrite_log()?;
        info!(
            "Installed snapshot at index {} (kept {} entries)",
            index,
            self.entries.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_core::{Member, MemberId, Roster};
    use replica_raft::EntryPayload;
    use tempfile::TempDir;

    fn command(term: u64, index: LogIndex, byte: u8) -> LogEntry {
        LogEntry::new(term, index, EntryPayload::Command(vec![byte]))
    }

    fn snapshot_at(index: LogIndex, term: u64) -> Snapshot {
        Snapshot {
            meta: SnapshotMeta {
                last_included_index: index,
                last_included_term: term,
                roster: Roster::new([Member::new("node1", "127.0.0.1:7001")]),
            },
            data: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn test_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 0);
        assert_eq!(store.last_term(), 0);
        assert_eq!(store.hard_state(), HardState::default());
        assert!(store.snapshot().is_none());
    }

    #[test]
    fn test_hard_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            store
                .save_hard_state(&HardState {
                    term: 7,
                    voted_for: Some(MemberId::from("node2")),
                    commit: 3,
                })
                .unwrap();
        }
        let store = FileLogStore::open(dir.path()).unwrap();
        let hard = store.hard_state();
        assert_eq!(hard.term, 7);
        assert_eq!(hard.voted_for, Some(MemberId::from("node2")));
        assert_eq!(hard.commit, 3);
        assert!(!dir.path().join("hard_state.tmp").exists());
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            store
                .append(&[command(1, 1, 1), command(1, 2, 2)])
                .unwrap();
            store.append(&[command(2, 3, 3)]).unwrap();
            store.flush().unwrap();
        }
        let store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.last_term(), 2);
        assert_eq!(store.get(2), Some(command(1, 2, 2)));
        assert_eq!(store.entries(2, 10).len(), 2);
    }

    #[test]
    fn test_rejects_gap() {
        let dir = TempDir::new().unwrap();
        let mut store = FileLogStore::open(dir.path()).unwrap();
        assert!(store.append(&[command(1, 2, 0)]).is_err());
    }

    #[test]
    fn test_truncate_then_append_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            store
                .append(&[command(1, 1, 1), command(1, 2, 2), command(1, 3, 3)])
                .unwrap();
            store.truncate_from(2).unwrap();
            assert_eq!(store.last_index(), 1);
            store.append(&[command(2, 2, 9)]).unwrap();
            store.flush().unwrap();
        }
        let store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.get(2), Some(command(2, 2, 9)));
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            store
                .append(&[command(1, 1, 1), command(1, 2, 2)])
                .unwrap();
            store.flush().unwrap();
        }
        // Half of a third record.
        let mut log = OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap();
        log.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(log);

        let mut store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.last_index(), 2);
        store.append(&[command(1, 3, 3)]).unwrap();
        drop(store);

        let store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.get(3), Some(command(1, 3, 3)));
    }

    #[test]
    fn test_compaction_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            store
                .append(&[
                    command(1, 1, 1),
                    command(1, 2, 2),
                    command(2, 3, 3),
                    command(2, 4, 4),
                ])
                .unwrap();
            store.compact(snapshot_at(2, 1)).unwrap();
            assert_eq!(store.first_index(), 3);
            assert_eq!(store.len(), 2);
        }
        let store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.snapshot_index(), 2);
        assert_eq!(store.term_at(2), Some(1));
        assert_eq!(store.term_at(1), None);
        assert_eq!(store.last_index(), 4);
        assert_eq!(store.snapshot().unwrap().data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_install_snapshot_discards_conflicting_log() {
        let dir = TempDir::new().unwrap();
        let mut store = FileLogStore::open(dir.path()).unwrap();
        store
            .append(&[command(1, 1, 1), command(1, 2, 2)])
            .unwrap();
        store.install_snapshot(snapshot_at(5, 3)).unwrap();
        assert_eq!(store.last_index(), 5);
        assert_eq!(store.last_term(), 3);
        assert!(store.is_empty());
    }

    #[test]
    fn test_install_snapshot_keeps_matching_suffix() {
        let dir = TempDir::new().unwrap();
        let mut store = FileLogStore::open(dir.path()).unwrap();
        store
            .append(&[command(1, 1, 1), command(2, 2, 2), command(2, 3, 3)])
            .unwrap();
        store.install_snapshot(snapshot_at(2, 2)).unwrap();
        assert_eq!(store.first_index(), 3);
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.get(3), Some(command(2, 3, 3)));
    }

    #[test]
    fn test_stale_records_below_snapshot_are_dropped_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            store
                .append(&[command(1, 1, 1), command(1, 2, 2), command(1, 3, 3)])
                .unwrap();
            store.flush().unwrap();
        }
        // Crash after the snapshot was written but before the log rewrite.
        let bytes = bincode::serialize(&snapshot_at(2, 1)).unwrap();
        fs::write(dir.path().join(SNAPSHOT_FILE), bytes).unwrap();

        let store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.first_index(), 3);
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_conflicting_suffix_is_dropped_after_interrupted_install() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            store
                .append(&[
                    command(1, 1, 1),
                    command(1, 2, 2),
                    command(1, 3, 3),
                    command(1, 4, 4),
                ])
                .unwrap();
            store.flush().unwrap();
        }
        // A leader's snapshot at term 3 landed, then the process died before
        // the conflicting entries were removed from the log.
        let bytes = bincode::serialize(&snapshot_at(2, 3)).unwrap();
        fs::write(dir.path().join(SNAPSHOT_FILE), bytes).unwrap();

        let store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.last_term(), 3);
        assert_eq!(store.term_at(3), None);
        assert!(store.is_empty());

        // The rewritten log stays consistent across another restart.
        drop(store);
        let store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.last_index(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_agreeing_suffix_survives_interrupted_install() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            store
                .append(&[command(1, 1, 1), command(3, 2, 2), command(3, 3, 3)])
                .unwrap();
            store.flush().unwrap();
        }
        let bytes = bincode::serialize(&snapshot_at(2, 3)).unwrap();
        fs::write(dir.path().join(SNAPSHOT_FILE), bytes).unwrap();

        let store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.get(3), Some(command(3, 3, 3)));
    }
}
