//! In-process helpers for exercising clusters without sockets.
//!
//! `LocalTransporter` delivers RPCs by calling the target server directly and
//! can cut nodes off to simulate partitions. `RecordingStateMachine` keeps
//! every blob it sees so tests can assert on what was applied or recovered.

use crate::config::RaftSettings;
use crate::error::TransportError;
use crate::replicator::{
    AppendEntriesRequest, AppendEntriesResponse, RaftServer, SledStorage, SnapshotRequest,
    SnapshotResponse, StateMachine, Transporter, VoteRequest, VoteResponse,
};
use crate::types::{NodeId, NodeStatus, PeerInfo};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

#[derive(Clone, Default)]
pub struct LocalTransporter {
    servers: Arc<RwLock<HashMap<NodeId, RaftServer>>>,
    isolated: Arc<RwLock<HashSet<NodeId>>>,
}

impl LocalTransporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server: RaftServer) {
        if let Ok(mut servers) = self.servers.write() {
            servers.insert(server.name().to_string(), server);
        }
    }

    pub fn unregister(&self, name: &str) {
        if let Ok(mut servers) = self.servers.write() {
            servers.remove(name);
        }
    }

    /// Drops every message to or from `name` until [`LocalTransporter::heal`].
    pub fn isolate(&self, name: &str) {
        if let Ok(mut isolated) = self.isolated.write() {
            isolated.insert(name.to_string());
        }
    }

    pub fn heal(&self, name: &str) {
        if let Ok(mut isolated) = self.isolated.write() {
            isolated.remove(name);
        }
    }

    fn route(&self, from: &str, to: &PeerInfo) -> Result<RaftServer, TransportError> {
        let cut = self
            .isolated
            .read()
            .map(|isolated| isolated.contains(from) || isolated.contains(&to.name))
            .unwrap_or(true);
        if cut {
            return Err(TransportError::Unreachable(to.name.clone()));
        }
        self.servers
            .read()
            .ok()
            .and_then(|servers| servers.get(&to.name).cloned())
            .ok_or_else(|| TransportError::Unreachable(to.name.clone()))
    }
}

#[async_trait]
impl Transporter for LocalTransporter {
    async fn send_vote_request(
        &self,
        peer: &PeerInfo,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        let server = self.route(&req.candidate_name, peer)?;
        server
            .request_vote(req)
            .await
            .map_err(|_| TransportError::Unreachable(peer.name.clone()))
    }

    async fn send_append_entries(
        &self,
        peer: &PeerInfo,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let server = self.route(&req.leader_name, peer)?;
        server
            .append_entries(req)
            .await
            .map_err(|_| TransportError::Unreachable(peer.name.clone()))
    }

    async fn send_snapshot_request(
        &self,
        peer: &PeerInfo,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse, TransportError> {
        let server = self.route(&req.leader_name, peer)?;
        server
            .snapshot_recovery(req)
            .await
            .map_err(|_| TransportError::Unreachable(peer.name.clone()))
    }
}

#[derive(Default)]
struct Recorded {
    applied: Vec<Vec<u8>>,
    recovered: Vec<Vec<u8>>,
    state: Option<Vec<u8>>,
    fail_save: bool,
    fail_recover: bool,
    fail_apply: bool,
}

/// State machine that remembers everything. `save` returns the configured
/// blob, or the concatenation of applied commands when none is set.
#[derive(Clone, Default)]
pub struct RecordingStateMachine {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: Vec<u8>) -> Self {
        let sm = Self::default();
        sm.set_state(state);
        sm
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: Vec<u8>) {
        self.lock().state = Some(state);
    }

    pub fn applied(&self) -> Vec<Vec<u8>> {
        self.lock().applied.clone()
    }

    pub fn recovered(&self) -> Vec<Vec<u8>> {
        self.lock().recovered.clone()
    }

    pub fn fail_save(&self, fail: bool) {
        self.lock().fail_save = fail;
    }

    pub fn fail_recover(&self, fail: bool) {
        self.lock().fail_recover = fail;
    }

    pub fn fail_apply(&self, fail: bool) {
        self.lock().fail_apply = fail;
    }
}

impl StateMachine for RecordingStateMachine {
    fn save(&self) -> anyhow::Result<Vec<u8>> {
        let recorded = self.lock();
        if recorded.fail_save {
            anyhow::bail!("save refused");
        }
        Ok(recorded
            .state
            .clone()
            .unwrap_or_else(|| recorded.applied.concat()))
    }

    fn recover(&mut self, state: &[u8]) -> anyhow::Result<()> {
        let mut recorded = self.lock();
        if recorded.fail_recover {
            anyhow::bail!("recover refused");
        }
        recorded.recovered.push(state.to_vec());
        Ok(())
    }

    fn apply(&mut self, command: &[u8]) -> anyhow::Result<()> {
        let mut recorded = self.lock();
        if recorded.fail_apply {
            anyhow::bail!("apply refused");
        }
        recorded.applied.push(command.to_vec());
        Ok(())
    }
}

/// Timings short enough for tests to elect leaders in well under a second.
/// Automatic snapshots are off so tests decide when to compact.
pub fn test_settings() -> RaftSettings {
    RaftSettings {
        heartbeat_interval_ms: 20,
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        rpc_timeout_ms: 200,
        command_timeout_ms: 2000,
        snapshot_threshold: 0,
        max_append_entries: 64,
    }
}

/// Polls `server` until `check` passes. Returns false on timeout.
pub async fn wait_until<F>(server: &RaftServer, timeout: Duration, check: F) -> bool
where
    F: Fn(&NodeStatus) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check(&server.status().await) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Returns the first of `servers` that reports itself leader.
pub async fn wait_for_leader(servers: &[RaftServer], timeout: Duration) -> Option<RaftServer> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for server in servers {
            if server.is_leader().await {
                return Some(server.clone());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Builds a server wired to `transporter`, registers it and starts its
/// ticker. The node name doubles as its address.
pub fn spawn_local_server<S>(
    name: &str,
    transporter: &LocalTransporter,
    state_machine: S,
    storage: SledStorage,
    settings: RaftSettings,
) -> crate::error::Result<RaftServer>
where
    S: StateMachine + 'static,
{
    let server = RaftServer::new(
        name,
        name,
        settings,
        storage,
        Box::new(state_machine),
        Arc::new(transporter.clone()),
    )?;
    transporter.register(server.clone());
    server.start();
    Ok(server)
}
