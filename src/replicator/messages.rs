use crate::replicator::snapshot::Snapshot;
use crate::types::{LogEntry, NodeId, PeerInfo};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_name: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_name: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub commit_index: u64,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `index` is the last index the follower verified against the request on
/// success, or a hint for where the leader should resume probing on failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub index: u64,
    pub commit_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    pub term: u64,
    pub leader_name: NodeId,
    pub last_index: u64,
    pub last_term: u64,
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
    pub state: Vec<u8>,
}

impl SnapshotRequest {
    pub fn new(term: u64, leader_name: NodeId, snapshot: &Snapshot) -> Self {
        Self {
            term,
            leader_name,
            last_index: snapshot.last_index,
            last_term: snapshot.last_term,
            peers: snapshot.peers.clone(),
            state: snapshot.state.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub term: u64,
    pub success: bool,
    pub commit_index: u64,
}

impl SnapshotResponse {
    pub fn new(term: u64, success: bool, commit_index: u64) -> Self {
        Self {
            term,
            success,
            commit_index,
        }
    }
}
