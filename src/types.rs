use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type NodeId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    Join { name: NodeId, addr: String },
    Leave { name: NodeId },
    NoOp,
    Payload(Vec<u8>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, command: Command) -> Self {
        Self {
            index,
            term,
            command,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub name: NodeId,
    pub addr: String,
}

/// Cluster membership: member name to the address its RPC endpoint listens on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClusterConfig {
    members: BTreeMap<NodeId, String>,
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: NodeId, addr: String) {
        self.members.insert(name, addr);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.members.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn addr_of(&self, name: &str) -> Option<&str> {
        self.members.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn names(&self) -> impl Iterator<Item = &NodeId> {
        self.members.keys()
    }

    /// Every member except `me`.
    pub fn peers_of<'a>(&'a self, me: &'a str) -> impl Iterator<Item = PeerInfo> + 'a {
        self.members
            .iter()
            .filter(move |(name, _)| name.as_str() != me)
            .map(|(name, addr)| PeerInfo {
                name: name.clone(),
                addr: addr.clone(),
            })
    }

    pub fn to_peer_list(&self) -> Vec<PeerInfo> {
        self.members
            .iter()
            .map(|(name, addr)| PeerInfo {
                name: name.clone(),
                addr: addr.clone(),
            })
            .collect()
    }

    pub fn from_peer_list(peers: &[PeerInfo]) -> Self {
        let mut config = Self::new();
        for peer in peers {
            config.insert(peer.name.clone(), peer.addr.clone());
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub last_index: u64,
    pub last_term: u64,
    pub size_bytes: usize,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerProgress {
    pub name: NodeId,
    pub next_index: u64,
    pub match_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub start_index: u64,
    pub start_term: u64,
    pub last_log_index: u64,
    pub log_len: usize,
    pub members: Vec<PeerInfo>,
    pub snapshot: Option<SnapshotSummary>,
    /// Per-follower progress; empty unless this node leads.
    pub replication: Vec<PeerProgress>,
    pub storage_bytes: u64,
    pub halted: bool,
}

impl NodeStatus {
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}
