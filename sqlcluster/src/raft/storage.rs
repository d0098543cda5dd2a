//! Disk-backed raft storage.
//!
//! The in-memory `MemStorage` from raft-rs is the working copy; every
//! accepted entry and hard-state change is mirrored to the node's data
//! directory so the committed log survives a restart. The log is the sole
//! durability mechanism: there is no engine snapshotting and no compaction,
//! so a restarting node reloads the full log and replays it through the
//! state machine. The only snapshots handled here are the metadata-only
//! ones raft needs for bootstrap and for bringing up a fresh joiner.

use protobuf::Message;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Result, Storage};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "raft.log";
const STATE_FILE: &str = "raft.state";
const SNAPSHOT_FILE: &str = "snapshot";
const ENTRY_HEADER_SIZE: u64 = 8;

fn store_err(e: impl std::error::Error + Send + Sync + 'static) -> raft::Error {
    raft::Error::Store(raft::StorageError::Other(Box::new(e)))
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct HardStateRecord {
    term: u64,
    vote: u64,
    commit: u64,
}

/// Append-only entry log: consecutive `[u64 le length][entry bytes]` frames.
struct LogFile {
    file: File,
    positions: BTreeMap<u64, u64>, // entry index -> file offset
}

impl LogFile {
    /// Opens the log and returns all decodable entries in file order. A
    /// corrupt or partially-written tail is truncated away.
    fn open<P: AsRef<Path>>(path: P) -> io::Result<(LogFile, Vec<Entry>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let mut positions = BTreeMap::new();
        let mut entries = Vec::new();
        let mut pos = 0u64;

        file.seek(SeekFrom::Start(0))?;
        while pos + ENTRY_HEADER_SIZE <= len {
            let mut header = [0u8; 8];
            file.read_exact(&mut header)?;
            let entry_len = u64::from_le_bytes(header);
            if pos + ENTRY_HEADER_SIZE + entry_len > len {
                break;
            }
            let mut buf = vec![0u8; entry_len as usize];
            file.read_exact(&mut buf)?;

            let mut entry = Entry::default();
            if entry.merge_from_bytes(&buf).is_err() {
                break;
            }
            positions.insert(entry.index, pos);
            entries.push(entry);
            pos += ENTRY_HEADER_SIZE + entry_len;
        }
        if pos < len {
            log::warn!("truncating corrupt raft log tail at offset {}", pos);
            file.set_len(pos)?;
        }

        Ok((LogFile { file, positions }, entries))
    }

    /// Appends entries, truncating any conflicting suffix first: raft may
    /// legitimately re-propose a different entry at an index that was never
    /// committed.
    fn append(&mut self, entries: &[Entry]) -> io::Result<()> {
        for entry in entries {
            if let Some(&pos) = self.positions.get(&entry.index) {
                self.file.set_len(pos)?;
                self.positions.split_off(&entry.index);
            }

            let data = entry
                .write_to_bytes()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let pos = self.file.seek(SeekFrom::End(0))?;
            self.file.write_all(&(data.len() as u64).to_le_bytes())?;
            self.file.write_all(&data)?;
            self.positions.insert(entry.index, pos);
        }
        self.file.sync_data()?;
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.positions.clear();
        Ok(())
    }
}

pub struct DiskStorage {
    mem_storage: MemStorage,
    log: LogFile,
    base_path: PathBuf,
}

impl DiskStorage {
    /// Opens (or initializes) storage under `base_path`. `bootstrap_id`
    /// seeds a brand-new single-voter cluster; it is ignored once a
    /// snapshot exists on disk.
    pub fn new<P: AsRef<Path>>(base_path: P, bootstrap_id: Option<u64>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let mem_storage = MemStorage::new();

        let snapshot_path = base_path.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let snapshot_data = fs::read(&snapshot_path).map_err(store_err)?;
            let mut snapshot = Snapshot::default();
            snapshot.merge_from_bytes(&snapshot_data).map_err(store_err)?;
            mem_storage.wl().apply_snapshot(snapshot)?;
        } else if let Some(id) = bootstrap_id {
            let mut snapshot = Snapshot::default();
            snapshot.mut_metadata().index = 1;
            snapshot.mut_metadata().term = 1;
            snapshot.mut_metadata().mut_conf_state().voters = vec![id];
            let snapshot_data = snapshot.write_to_bytes().map_err(store_err)?;
            fs::write(&snapshot_path, snapshot_data).map_err(store_err)?;
            mem_storage.wl().apply_snapshot(snapshot)?;
        }

        let (log, entries) = LogFile::open(base_path.join(LOG_FILE)).map_err(store_err)?;
        let last_index = mem_storage.last_index().unwrap_or_default();
        let pending: Vec<Entry> = entries.into_iter().filter(|e| e.index > last_index).collect();
        if !pending.is_empty() {
            mem_storage.wl().append(&pending)?;
        }

        let state_path = base_path.join(STATE_FILE);
        if state_path.exists() {
            let record: HardStateRecord =
                bincode::deserialize(&fs::read(&state_path).map_err(store_err)?)
                    .map_err(store_err)?;
            let mut hs = HardState::default();
            hs.term = record.term;
            hs.vote = record.vote;
            // A crash between the state write and the log write can leave the
            // recorded commit ahead of the reloaded log.
            hs.commit = record.commit.min(mem_storage.last_index()?);
            mem_storage.wl().set_hardstate(hs);
        }

        Ok(DiskStorage {
            mem_storage,
            log,
            base_path,
        })
    }

    /// Whether a node's data directory holds any replicated log entries yet.
    pub fn log_is_empty<P: AsRef<Path>>(base_path: P) -> bool {
        fs::metadata(base_path.as_ref().join(LOG_FILE))
            .map(|m| m.len() == 0)
            .unwrap_or(true)
    }

    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mem_storage.wl().append(entries)?;
        self.log.append(entries).map_err(store_err)
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) {
        self.mem_storage.wl().set_conf_state(conf_state);
    }

    pub fn set_hardstate(&mut self, hs: HardState) {
        self.persist_hard_state(&hs);
        self.mem_storage.wl().set_hardstate(hs);
    }

    pub fn set_commit(&mut self, commit: u64) {
        let hs = {
            let mut core = self.mem_storage.wl();
            let hard_state = core.mut_hard_state();
            hard_state.set_commit(commit);
            hard_state.clone()
        };
        self.persist_hard_state(&hs);
    }

    /// Installs a snapshot received from the leader. Snapshots carry no
    /// engine data in this system, so this only resets raft metadata; the
    /// now-obsolete local log is discarded with it.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let snapshot_path = self.base_path.join(SNAPSHOT_FILE);
        let temp_path = self.base_path.join("snapshot.tmp");
        let snapshot_data = snapshot.write_to_bytes().map_err(store_err)?;
        fs::write(&temp_path, &snapshot_data).map_err(store_err)?;
        fs::rename(&temp_path, &snapshot_path).map_err(store_err)?;

        self.mem_storage.wl().apply_snapshot(snapshot.clone())?;
        self.log.clear().map_err(store_err)?;
        Ok(())
    }

    fn persist_hard_state(&self, hs: &HardState) {
        let record = HardStateRecord {
            term: hs.term,
            vote: hs.vote,
            commit: hs.commit,
        };
        let state_path = self.base_path.join(STATE_FILE);
        let temp_path = self.base_path.join("raft.state.tmp");
        let write = bincode::serialize(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .and_then(|data| fs::write(&temp_path, data))
            .and_then(|_| fs::rename(&temp_path, &state_path));
        if let Err(e) = write {
            log::error!("failed to persist raft hard state: {}", e);
        }
    }
}

impl Storage for DiskStorage {
    fn initial_state(&self) -> Result<RaftState> {
        self.mem_storage.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> Result<Vec<Entry>> {
        self.mem_storage.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> Result<u64> {
        self.mem_storage.term(idx)
    }

    fn first_index(&self) -> Result<u64> {
        self.mem_storage.first_index()
    }

    fn last_index(&self) -> Result<u64> {
        self.mem_storage.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> Result<Snapshot> {
        self.mem_storage.snapshot(request_index, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = data.to_vec().into();
        e
    }

    #[test]
    fn bootstrap_seeds_single_voter() {
        let dir = tempdir().unwrap();
        let storage = DiskStorage::new(dir.path(), Some(7)).unwrap();
        let state = storage.initial_state().unwrap();
        assert_eq!(state.conf_state.voters, vec![7]);
        assert_eq!(storage.last_index().unwrap(), 1);
        assert!(DiskStorage::log_is_empty(dir.path()));
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut storage = DiskStorage::new(dir.path(), Some(1)).unwrap();
            storage
                .append_entries(&[entry(2, 1, b"first"), entry(3, 1, b"second")])
                .unwrap();
        }
        assert!(!DiskStorage::log_is_empty(dir.path()));

        let storage = DiskStorage::new(dir.path(), Some(1)).unwrap();
        assert_eq!(storage.last_index().unwrap(), 3);
        let loaded = storage
            .entries(2, 4, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(loaded[0].data.as_ref(), b"first");
        assert_eq!(loaded[1].data.as_ref(), b"second");
    }

    #[test]
    fn conflicting_append_truncates_suffix() {
        let dir = tempdir().unwrap();
        {
            let mut storage = DiskStorage::new(dir.path(), Some(1)).unwrap();
            storage
                .append_entries(&[
                    entry(2, 1, b"keep"),
                    entry(3, 1, b"replace me"),
                    entry(4, 1, b"drop me"),
                ])
                .unwrap();
            storage.append_entries(&[entry(3, 2, b"replaced")]).unwrap();
        }

        let storage = DiskStorage::new(dir.path(), Some(1)).unwrap();
        assert_eq!(storage.last_index().unwrap(), 3);
        let loaded = storage
            .entries(2, 4, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(loaded[0].data.as_ref(), b"keep");
        assert_eq!(loaded[1].data.as_ref(), b"replaced");
        assert_eq!(loaded[1].term, 2);
    }

    #[test]
    fn hard_state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut storage = DiskStorage::new(dir.path(), Some(1)).unwrap();
            storage.append_entries(&[entry(2, 2, b"x")]).unwrap();
            let mut hs = HardState::default();
            hs.term = 2;
            hs.vote = 1;
            hs.commit = 2;
            storage.set_hardstate(hs);
        }

        let storage = DiskStorage::new(dir.path(), Some(1)).unwrap();
        let state = storage.initial_state().unwrap();
        assert_eq!(state.hard_state.term, 2);
        assert_eq!(state.hard_state.vote, 1);
        assert_eq!(state.hard_state.commit, 2);
    }

    #[test]
    fn recorded_commit_is_clamped_to_reloaded_log() {
        let dir = tempdir().unwrap();
        {
            let mut storage = DiskStorage::new(dir.path(), Some(1)).unwrap();
            storage.append_entries(&[entry(2, 1, b"x")]).unwrap();
            let mut hs = HardState::default();
            hs.term = 1;
            hs.commit = 9; // ahead of anything on disk
            storage.set_hardstate(hs);
        }

        let storage = DiskStorage::new(dir.path(), Some(1)).unwrap();
        assert_eq!(storage.initial_state().unwrap().hard_state.commit, 2);
    }
}
