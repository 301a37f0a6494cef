use crate::error::Result;
use crate::replicator::snapshot::Snapshot;
use crate::types::{LogEntry, NodeId};
use serde::{Deserialize, Serialize};
use std::path::Path;

const KEY_HARD_STATE: &[u8] = b"hard_state";
const KEY_COMMIT_INDEX: &[u8] = b"commit_index";
const KEY_SNAPSHOT: &[u8] = b"snapshot";

/// Term and vote, persisted before answering any RPC that changed them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

/// Durable home of the log entries, the hard state and the current snapshot.
///
/// Cloning is cheap and every clone shares the same underlying database.
#[derive(Clone)]
pub struct SledStorage {
    db: sled::Db,
    log_tree: sled::Tree,
    meta_tree: sled::Tree,
}

impl SledStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let log_tree = db.open_tree("raft_log")?;
        let meta_tree = db.open_tree("raft_meta")?;
        Ok(Self {
            db,
            log_tree,
            meta_tree,
        })
    }

    fn log_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    pub fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut batch = sled::Batch::default();
        for entry in entries {
            let value = bincode::serialize(entry)?;
            batch.insert(Self::log_key(entry.index).to_vec(), value);
        }
        self.log_tree.apply_batch(batch)?;
        self.log_tree.flush()?;
        Ok(())
    }

    /// Removes every entry with `index >= from_index`.
    pub fn truncate_from(&self, from_index: u64) -> Result<()> {
        let keys: Vec<_> = self
            .log_tree
            .range(Self::log_key(from_index)..)
            .keys()
            .collect::<std::result::Result<_, _>>()?;
        self.remove_keys(keys)
    }

    /// Removes every entry with `index <= upto_index`.
    pub fn purge_upto(&self, upto_index: u64) -> Result<()> {
        let keys: Vec<_> = self
            .log_tree
            .range(..=Self::log_key(upto_index))
            .keys()
            .collect::<std::result::Result<_, _>>()?;
        self.remove_keys(keys)
    }

    pub fn clear_log(&self) -> Result<()> {
        self.log_tree.clear()?;
        self.log_tree.flush()?;
        Ok(())
    }

    fn remove_keys(&self, keys: Vec<sled::IVec>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut batch = sled::Batch::default();
        for key in keys {
            batch.remove(key);
        }
        self.log_tree.apply_batch(batch)?;
        self.log_tree.flush()?;
        Ok(())
    }

    /// Persisted entries with `index > after`, in index order.
    pub fn load_entries_after(&self, after: u64) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for item in self.log_tree.range(Self::log_key(after.saturating_add(1))..) {
            let (_, value) = item?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    pub fn save_hard_state(&self, state: &HardState) -> Result<()> {
        self.meta_tree
            .insert(KEY_HARD_STATE, bincode::serialize(state)?)?;
        self.meta_tree.flush()?;
        Ok(())
    }

    pub fn load_hard_state(&self) -> Result<HardState> {
        match self.meta_tree.get(KEY_HARD_STATE)? {
            Some(raw) => Ok(bincode::deserialize(&raw)?),
            None => Ok(HardState::default()),
        }
    }

    pub fn save_commit_index(&self, index: u64) -> Result<()> {
        self.meta_tree
            .insert(KEY_COMMIT_INDEX, bincode::serialize(&index)?)?;
        self.meta_tree.flush()?;
        Ok(())
    }

    pub fn load_commit_index(&self) -> Result<u64> {
        match self.meta_tree.get(KEY_COMMIT_INDEX)? {
            Some(raw) => Ok(bincode::deserialize(&raw)?),
            None => Ok(0),
        }
    }

    /// Replaces the current snapshot record in a single write.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.meta_tree
            .insert(KEY_SNAPSHOT, bincode::serialize(snapshot)?)?;
        self.meta_tree.flush()?;
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        match self.meta_tree.get(KEY_SNAPSHOT)? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.db.size_on_disk()?)
    }
}
