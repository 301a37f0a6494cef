use crate::error::{RaftError, Result};
use crate::replicator::storage::SledStorage;
use crate::types::LogEntry;
use tracing::{debug, info};

/// The uncompacted tail of the replicated log plus its snapshot boundary.
///
/// `start_index`/`start_term` name the last entry folded into the current
/// snapshot (0/0 when there is none). `entries[i].index == start_index + i + 1`
/// and `commit_index >= start_index` hold after every operation.
pub struct LogStore {
    storage: SledStorage,
    entries: Vec<LogEntry>,
    start_index: u64,
    start_term: u64,
    commit_index: u64,
}

impl LogStore {
    /// An empty store. Nothing is read from disk until [`LogStore::replay`] or
    /// a snapshot install hydrates it.
    pub fn new(storage: SledStorage) -> Self {
        Self {
            storage,
            entries: Vec::new(),
            start_index: 0,
            start_term: 0,
            commit_index: 0,
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    pub fn start_term(&self) -> u64 {
        self.start_term
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.start_index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.start_term)
    }

    /// Committed entries that have not been folded into a snapshot yet.
    pub fn compactable_len(&self) -> u64 {
        self.commit_index - self.start_index
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.start_index {
            return None;
        }
        self.entries.get((index - self.start_index - 1) as usize)
    }

    /// Term of the entry at `index`. The snapshot boundary itself still has a
    /// known term; anything before it is gone.
    pub fn term_at(&self, index: u64) -> Result<Option<u64>> {
        if index < self.start_index {
            return Err(RaftError::Compacted {
                index,
                start_index: self.start_index,
            });
        }
        if index == self.start_index {
            return Ok(Some(self.start_term));
        }
        Ok(self.entry(index).map(|e| e.term))
    }

    pub fn commit_info(&self) -> (u64, u64) {
        if self.commit_index == 0 {
            return (0, 0);
        }
        if self.commit_index == self.start_index {
            return (self.start_index, self.start_term);
        }
        let term = self.entry(self.commit_index).map(|e| e.term).unwrap_or(0);
        (self.commit_index, term)
    }

    /// Entries after `index`, at most `max` of them. Fails with `Compacted`
    /// when the caller needs history that only survives inside the snapshot.
    pub fn get_entries_after(&self, index: u64, max: usize) -> Result<Vec<LogEntry>> {
        if index < self.start_index {
            return Err(RaftError::Compacted {
                index,
                start_index: self.start_index,
            });
        }
        let offset = (index - self.start_index) as usize;
        if offset >= self.entries.len() {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(max).min(self.entries.len());
        Ok(self.entries[offset..end].to_vec())
    }

    /// Appends `entries`, overwriting any uncommitted suffix from the first
    /// appended index onward. The write is durable before this returns.
    pub fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let first_index = first.index;

        if first_index <= self.commit_index {
            return Err(RaftError::Conflict {
                index: first_index,
                commit_index: self.commit_index,
            });
        }
        let next = self.last_index() + 1;
        if first_index > next {
            return Err(RaftError::OutOfOrder {
                expected: next,
                got: first_index,
            });
        }
        for (i, entry) in entries.iter().enumerate() {
            if entry.index != first_index + i as u64 {
                return Err(RaftError::OutOfOrder {
                    expected: first_index + i as u64,
                    got: entry.index,
                });
            }
        }

        if first_index < next {
            debug!(from = first_index, "truncating uncommitted log suffix");
            self.storage.truncate_from(first_index)?;
            self.entries
                .truncate((first_index - self.start_index - 1) as usize);
        }

        self.storage.append_entries(&entries)?;
        self.entries.extend(entries);
        Ok(())
    }

    /// Advances the commit index; it never moves backwards or past the log.
    pub fn set_commit_index(&mut self, index: u64) -> Result<bool> {
        let index = index.min(self.last_index());
        if index <= self.commit_index {
            return Ok(false);
        }
        self.storage.save_commit_index(index)?;
        self.commit_index = index;
        Ok(true)
    }

    /// Drops every entry with `index <= upto_index`.
    ///
    /// The boundary must be committed and must name either a real entry with
    /// the same term or the current snapshot boundary. Otherwise the log is
    /// left untouched.
    pub fn compact(&mut self, upto_index: u64, upto_term: u64) -> Result<()> {
        let invalid = |reason| RaftError::InvalidCompaction {
            index: upto_index,
            term: upto_term,
            reason,
        };

        if upto_index > self.commit_index {
            return Err(invalid("boundary is not committed"));
        }
        if upto_index < self.start_index {
            return Err(invalid("boundary precedes the current snapshot"));
        }
        if upto_index == self.start_index {
            if upto_term != self.start_term {
                return Err(invalid("term differs from the snapshot boundary"));
            }
            return Ok(());
        }
        match self.entry(upto_index) {
            Some(entry) if entry.term == upto_term => {}
            Some(_) => return Err(invalid("term differs from the entry at that index")),
            None => return Err(invalid("no entry at that index")),
        }

        self.storage.purge_upto(upto_index)?;
        let dropped = (upto_index - self.start_index) as usize;
        self.entries.drain(..dropped);
        self.start_index = upto_index;
        self.start_term = upto_term;
        info!(
            start_index = upto_index,
            start_term = upto_term,
            remaining = self.entries.len(),
            "log compacted"
        );
        Ok(())
    }

    /// Resets the log to a snapshot received from the leader: no entries, and
    /// everything up to `last_index` committed. Whatever was on disk may
    /// disagree with the leader, so it is discarded as well.
    pub fn install_boundary(&mut self, last_index: u64, last_term: u64) -> Result<()> {
        self.storage.clear_log()?;
        self.reset_to(last_index, last_term)
    }

    /// Resets the log to the locally persisted snapshot. Persisted entries
    /// above the boundary stay on disk so a later [`LogStore::replay`] can
    /// bring them back.
    pub fn restore_boundary(&mut self, last_index: u64, last_term: u64) -> Result<()> {
        self.storage.purge_upto(last_index)?;
        self.reset_to(last_index, last_term)
    }

    fn reset_to(&mut self, last_index: u64, last_term: u64) -> Result<()> {
        if self.storage.load_commit_index()? < last_index {
            self.storage.save_commit_index(last_index)?;
        }
        self.entries.clear();
        self.start_index = last_index;
        self.start_term = last_term;
        self.commit_index = last_index;
        Ok(())
    }

    /// Loads the persisted entries above the current boundary and the
    /// persisted commit index. Entries the boundary already covers are
    /// skipped; a hole between the boundary and the first persisted entry is
    /// an error.
    pub fn replay(&mut self) -> Result<usize> {
        let persisted = self.storage.load_entries_after(self.start_index)?;
        let mut expected = self.start_index + 1;
        let mut loaded = Vec::with_capacity(persisted.len());
        for entry in persisted {
            if entry.index != expected {
                return Err(RaftError::LogGap {
                    after: expected - 1,
                });
            }
            expected += 1;
            loaded.push(entry);
        }

        let count = loaded.len();
        self.entries = loaded;
        let persisted_commit = self.storage.load_commit_index()?;
        self.commit_index = persisted_commit
            .min(self.last_index())
            .max(self.start_index);
        debug!(
            entries = count,
            commit_index = self.commit_index,
            "replayed persisted log"
        );
        Ok(count)
    }
}
