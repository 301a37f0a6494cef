use crate::error::{RaftError, Result};
use crate::replicator::log_store::LogStore;
use crate::replicator::messages::{SnapshotRequest, SnapshotResponse};
use crate::replicator::state_machine::StateMachine;
use crate::replicator::storage::SledStorage;
use crate::types::{ClusterConfig, PeerInfo, SnapshotSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything up to and including `last_index`/`last_term`, folded into
/// `state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub last_index: u64,
    pub last_term: u64,
    pub peers: Vec<PeerInfo>,
    pub state: Vec<u8>,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn membership(&self) -> ClusterConfig {
        ClusterConfig::from_peer_list(&self.peers)
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            last_index: self.last_index,
            last_term: self.last_term,
            size_bytes: self.state.len(),
            taken_at: self.taken_at,
        }
    }
}

impl From<SnapshotRequest> for Snapshot {
    fn from(req: SnapshotRequest) -> Self {
        Self {
            last_index: req.last_index,
            last_term: req.last_term,
            peers: req.peers,
            state: req.state,
            taken_at: Utc::now(),
        }
    }
}

/// Owns the single current snapshot of a server and keeps the snapshot record
/// on disk ahead of any log compaction that depends on it.
pub struct SnapshotManager {
    storage: SledStorage,
    current: Option<Arc<Snapshot>>,
}

impl SnapshotManager {
    pub fn new(storage: SledStorage) -> Self {
        Self {
            storage,
            current: None,
        }
    }

    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.clone()
    }

    /// Captures the state machine at the commit index, persists it and only
    /// then compacts the log up to that point.
    pub fn take(
        &mut self,
        log: &mut LogStore,
        state_machine: &dyn StateMachine,
        membership: &ClusterConfig,
    ) -> Result<Arc<Snapshot>> {
        let last_index = log.commit_index();
        if last_index == log.start_index() {
            if let Some(current) = &self.current {
                if current.last_index == last_index {
                    return Ok(current.clone());
                }
            }
        }
        let last_term = log
            .term_at(last_index)?
            .filter(|_| last_index > 0)
            .ok_or(RaftError::InvalidCompaction {
                index: last_index,
                term: 0,
                reason: "nothing committed to snapshot",
            })?;

        let state = state_machine
            .save()
            .map_err(|e| RaftError::StateMachine(e.to_string()))?;

        let snapshot = Snapshot {
            last_index,
            last_term,
            peers: membership.to_peer_list(),
            state,
            taken_at: Utc::now(),
        };
        self.storage.save_snapshot(&snapshot)?;
        log.compact(last_index, last_term)?;

        info!(
            last_index,
            last_term,
            bytes = snapshot.state.len(),
            "snapshot taken"
        );
        let snapshot = Arc::new(snapshot);
        self.current = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Installs the most recently persisted snapshot into the log and the
    /// state machine.
    pub fn load(
        &mut self,
        log: &mut LogStore,
        state_machine: &mut dyn StateMachine,
    ) -> Result<Arc<Snapshot>> {
        let snapshot = self.storage.load_snapshot()?.ok_or(RaftError::NoSnapshot)?;

        state_machine
            .recover(&snapshot.state)
            .map_err(|e| RaftError::StateMachine(e.to_string()))?;
        log.restore_boundary(snapshot.last_index, snapshot.last_term)?;

        info!(
            last_index = snapshot.last_index,
            last_term = snapshot.last_term,
            "snapshot loaded from disk"
        );
        let snapshot = Arc::new(snapshot);
        self.current = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Installs a snapshot shipped by the leader. A request from an older term
    /// is refused with the receiver's term; a snapshot the log already covers
    /// is acknowledged without touching local state. Nothing is persisted
    /// unless the state machine accepted the snapshot.
    pub fn install_remote(
        &mut self,
        current_term: u64,
        req: SnapshotRequest,
        log: &mut LogStore,
        state_machine: &mut dyn StateMachine,
    ) -> Result<SnapshotResponse> {
        if req.term < current_term {
            warn!(
                from = %req.leader_name,
                term = req.term,
                current_term,
                "rejecting snapshot from stale term"
            );
            return Ok(SnapshotResponse::new(current_term, false, log.commit_index()));
        }
        if req.last_index <= log.commit_index() {
            return Ok(SnapshotResponse::new(current_term, true, log.commit_index()));
        }

        let leader = req.leader_name.clone();
        let snapshot = Snapshot::from(req);
        state_machine
            .recover(&snapshot.state)
            .map_err(|e| RaftError::StateMachine(e.to_string()))?;
        self.storage.save_snapshot(&snapshot)?;
        log.install_boundary(snapshot.last_index, snapshot.last_term)?;

        info!(
            from = %leader,
            last_index = snapshot.last_index,
            last_term = snapshot.last_term,
            "snapshot installed from leader"
        );
        let commit_index = snapshot.last_index;
        self.current = Some(Arc::new(snapshot));
        Ok(SnapshotResponse::new(current_term, true, commit_index))
    }
}
