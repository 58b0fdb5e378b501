// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Durable raft storage: log, stable state, and snapshot files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::node::{LogEntry, RaftPeer};
use crate::coordinator::fsm::FsmSnapshot;
use crate::error::{Error, Result};

fn encode_index(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// Append-only log entries in a sled tree (`<data-dir>/raft-log.db`)
pub struct LogStore {
    tree: sled::Db,
}

impl LogStore {
    /// Open or create the log store
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let path = data_dir.as_ref().join("raft-log.db");
        let tree = sled::open(&path)
            .map_err(|err| Error::internal(format!("open log store: {err}")))?;
        Ok(Self { tree })
    }

    /// Append an entry at its index
    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let payload = serde_json::to_vec(entry)?;
        self.tree
            .insert(encode_index(entry.index), payload)
            .map_err(|err| Error::internal(format!("log append: {err}")))?;
        Ok(())
    }

    /// Read one entry
    pub fn get(&self, index: u64) -> Result<Option<LogEntry>> {
        let found = self
            .tree
            .get(encode_index(index))
            .map_err(|err| Error::internal(format!("log read: {err}")))?;
        match found {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Term of the entry at `index`, if present
    pub fn term_at(&self, index: u64) -> Result<Option<u64>> {
        Ok(self.get(index)?.map(|e| e.term))
    }

    /// Highest index in the log, 0 when empty
    pub fn last_index(&self) -> Result<u64> {
        let last = self
            .tree
            .last()
            .map_err(|err| Error::internal(format!("log last: {err}")))?;
        match last {
            Some((key, _)) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key);
                Ok(u64::from_be_bytes(buf))
            }
            None => Ok(0),
        }
    }

    /// Lowest index in the log, 0 when empty
    pub fn first_index(&self) -> Result<u64> {
        let first = self
            .tree
            .first()
            .map_err(|err| Error::internal(format!("log first: {err}")))?;
        match first {
            Some((key, _)) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key);
                Ok(u64::from_be_bytes(buf))
            }
            None => Ok(0),
        }
    }

    /// Entries in `[from, to]` inclusive
    pub fn range(&self, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for index in from..=to {
            match self.get(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    /// Remove entries with index >= `from` (conflict truncation)
    pub fn truncate_from(&self, from: u64) -> Result<()> {
        let last = self.last_index()?;
        for index in from..=last {
            self.tree
                .remove(encode_index(index))
                .map_err(|err| Error::internal(format!("log truncate: {err}")))?;
        }
        Ok(())
    }

    /// Remove entries with index <= `to` (snapshot compaction)
    pub fn truncate_to(&self, to: u64) -> Result<()> {
        let first = self.first_index()?;
        if first == 0 {
            return Ok(());
        }
        for index in first..=to {
            self.tree
                .remove(encode_index(index))
                .map_err(|err| Error::internal(format!("log compact: {err}")))?;
        }
        Ok(())
    }
}

/// Durable term, vote, and membership (`<data-dir>/raft-stable.db`)
pub struct StableStore {
    tree: sled::Db,
}

impl StableStore {
    /// Open or create the stable store
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let path = data_dir.as_ref().join("raft-stable.db");
        let tree = sled::open(&path)
            .map_err(|err| Error::internal(format!("open stable store: {err}")))?;
        Ok(Self { tree })
    }

    /// Persist the current term and vote together
    pub fn set_term_and_vote(&self, term: u64, voted_for: Option<&str>) -> Result<()> {
        self.tree
            .insert(b"current_term", &term.to_be_bytes())
            .map_err(|err| Error::internal(format!("stable write: {err}")))?;
        match voted_for {
            Some(id) => self
                .tree
                .insert(b"voted_for", id.as_bytes())
                .map_err(|err| Error::internal(format!("stable write: {err}")))?,
            None => self
                .tree
                .remove(b"voted_for")
                .map_err(|err| Error::internal(format!("stable write: {err}")))?,
        };
        Ok(())
    }

    /// Load the persisted term, 0 when never set
    pub fn term(&self) -> Result<u64> {
        let found = self
            .tree
            .get(b"current_term")
            .map_err(|err| Error::internal(format!("stable read: {err}")))?;
        match found {
            Some(bytes) => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            None => Ok(0),
        }
    }

    /// Load the persisted vote
    pub fn voted_for(&self) -> Result<Option<String>> {
        let found = self
            .tree
            .get(b"voted_for")
            .map_err(|err| Error::internal(format!("stable read: {err}")))?;
        Ok(found.map(|bytes| String::from_utf8_lossy(&bytes).to_string()))
    }

    /// Persist cluster membership
    pub fn set_membership(&self, members: &[RaftPeer]) -> Result<()> {
        let payload = serde_json::to_vec(members)?;
        self.tree
            .insert(b"membership", payload)
            .map_err(|err| Error::internal(format!("stable write: {err}")))?;
        Ok(())
    }

    /// Load persisted membership, if any
    pub fn membership(&self) -> Result<Option<Vec<RaftPeer>>> {
        let found = self
            .tree
            .get(b"membership")
            .map_err(|err| Error::internal(format!("stable read: {err}")))?;
        match found {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// On-disk snapshot document (`<data-dir>/snapshots/`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    /// Index of the last entry folded into the snapshot
    pub last_included_index: u64,
    /// Term of that entry
    pub last_included_term: u64,
    /// Membership as of the snapshot
    pub membership: Vec<RaftPeer>,
    /// The serialized state machine
    pub fsm: FsmSnapshot,
}

/// File-based snapshot storage
pub struct SnapshotStore {
    directory: PathBuf,
}

impl SnapshotStore {
    /// Open or create the snapshot directory
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let directory = data_dir.as_ref().join("snapshots");
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    /// Persist a snapshot, replacing older ones
    pub fn save(&self, snapshot: &SnapshotFile) -> Result<()> {
        let path = self
            .directory
            .join(format!("snapshot-{:020}.json", snapshot.last_included_index));
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(snapshot)?)?;
        std::fs::rename(&tmp, &path)?;

        // Drop superseded snapshots
        for entry in std::fs::read_dir(&self.directory)? {
            let entry_path = entry?.path();
            if entry_path != path
                && entry_path.extension().and_then(|e| e.to_str()) == Some("json")
            {
                let _ = std::fs::remove_file(entry_path);
            }
        }
        Ok(())
    }

    /// Load the most recent snapshot, if any
    pub fn latest(&self) -> Result<Option<SnapshotFile>> {
        let mut newest: Option<PathBuf> = None;
        for entry in std::fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if newest.as_ref().map(|n| path > *n).unwrap_or(true) {
                newest = Some(path);
            }
        }
        match newest {
            Some(path) => {
                let bytes = std::fs::read(path)?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            None => Ok(None),
        }
    }
}
