use crate::config::RaftSettings;
use crate::error::{RaftError, Result};
use crate::replicator::log_store::LogStore;
use crate::replicator::messages::*;
use crate::replicator::network::Transporter;
use crate::replicator::peer::{PeerReplicator, PeerState, Round};
use crate::replicator::snapshot::{Snapshot, SnapshotManager};
use crate::replicator::state_machine::StateMachine;
use crate::replicator::storage::{HardState, SledStorage};
use crate::types::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

type Waiter = oneshot::Sender<Result<()>>;

/// Handle to one consensus server. Cheap to clone; every clone drives the
/// same node.
#[derive(Clone)]
pub struct RaftServer {
    pub(crate) inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) name: NodeId,
    pub(crate) settings: RaftSettings,
    pub(crate) transporter: Arc<dyn Transporter>,
    pub(crate) core: Mutex<Core>,
    shutdown_tx: watch::Sender<bool>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

/// All term, role and log state of a server. Only ever touched with the
/// server's core lock held.
pub(crate) struct Core {
    name: NodeId,
    addr: String,
    storage: SledStorage,
    pub(crate) role: Role,
    pub(crate) term: u64,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    pub(crate) log: LogStore,
    pub(crate) snapshots: SnapshotManager,
    state_machine: Box<dyn StateMachine>,
    membership: ClusterConfig,
    pub(crate) peers: HashMap<NodeId, PeerState>,
    pending: BTreeMap<u64, Waiter>,
    last_applied: u64,
    halted: Option<String>,
    last_heard: Instant,
    election_timeout: Duration,
    settings: RaftSettings,
}

impl Core {
    fn persist_hard_state(&self) -> Result<()> {
        self.storage.save_hard_state(&HardState {
            term: self.term,
            voted_for: self.voted_for.clone(),
        })
    }

    fn reset_election_timer(&mut self) {
        self.last_heard = Instant::now();
        self.election_timeout = self.settings.random_election_timeout();
    }

    fn election_due(&self) -> bool {
        self.last_heard.elapsed() >= self.election_timeout
    }

    /// Whether a leader is known to be alive, either this node or one heard
    /// from within the minimum election timeout.
    fn hears_leader(&self) -> bool {
        self.role == Role::Leader
            || (self.leader.is_some()
                && self.last_heard.elapsed() < self.settings.election_timeout_min())
    }

    fn can_campaign(&self) -> bool {
        self.halted.is_none() && self.membership.contains(&self.name)
    }

    /// Adopts `term` (if newer) and falls back to follower. Pending commands
    /// are failed since this node can no longer vouch for them.
    pub(crate) fn step_down(&mut self, term: u64) -> Result<()> {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.leader = None;
            self.persist_hard_state()?;
        }
        if self.role != Role::Follower {
            info!(term = self.term, from = %self.role, "stepping down to follower");
            self.role = Role::Follower;
            self.peers.clear();
            if self.leader.as_ref() == Some(&self.name) {
                self.leader = None;
            }
            let leader = self.leader.clone();
            self.fail_pending(|| RaftError::NotLeader {
                leader: leader.clone(),
            });
        }
        self.reset_election_timer();
        Ok(())
    }

    fn become_candidate(&mut self) -> Result<VoteRequest> {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.name.clone());
        self.leader = None;
        self.persist_hard_state()?;
        self.reset_election_timer();
        info!(term = self.term, "election timeout, campaigning");

        Ok(VoteRequest {
            term: self.term,
            candidate_name: self.name.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }

    fn append_command(&mut self, command: Command) -> Result<u64> {
        let index = self.log.last_index() + 1;
        self.log
            .append(vec![LogEntry::new(index, self.term, command)])?;
        Ok(index)
    }

    /// Highest index a quorum of members holds, committed only when it
    /// belongs to the current term.
    pub(crate) fn advance_leader_commit(&mut self) -> Result<bool> {
        let mut matched: Vec<u64> = self
            .membership
            .names()
            .map(|name| {
                if *name == self.name {
                    self.log.last_index()
                } else {
                    self.peers.get(name).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        if matched.is_empty() {
            return Ok(false);
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.membership.quorum() - 1];

        if candidate <= self.log.commit_index() {
            return Ok(false);
        }
        if self.log.term_at(candidate)? != Some(self.term) {
            return Ok(false);
        }
        let advanced = self.log.set_commit_index(candidate)?;
        if advanced {
            debug!(commit_index = candidate, "commit index advanced");
        }
        Ok(advanced)
    }

    /// Applies committed entries in order. Returns whether membership changed.
    fn apply_committed(&mut self) -> bool {
        let mut membership_changed = false;
        if self.halted.is_some() {
            return false;
        }

        while self.last_applied < self.log.commit_index() {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.entry(index) else {
                break;
            };

            let outcome = match &entry.command {
                Command::Join { name, addr } => {
                    info!(member = %name, %addr, index, "member joined");
                    self.membership.insert(name.clone(), addr.clone());
                    membership_changed = true;
                    Ok(())
                }
                Command::Leave { name } => {
                    if self.membership.remove(name) {
                        info!(member = %name, index, "member left");
                        membership_changed = true;
                    }
                    Ok(())
                }
                Command::NoOp => Ok(()),
                Command::Payload(bytes) => self.state_machine.apply(bytes),
            };

            match outcome {
                Ok(()) => {
                    self.last_applied = index;
                    if let Some(waiter) = self.pending.remove(&index) {
                        let _ = waiter.send(Ok(()));
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    error!(index, error = %reason, "state machine failed to apply committed entry");
                    if let Some(waiter) = self.pending.remove(&index) {
                        let _ = waiter.send(Err(RaftError::StateMachine(reason.clone())));
                    }
                    self.halt(reason);
                    break;
                }
            }
        }
        membership_changed
    }

    /// Stops applying and serving for good. The state machine can no longer
    /// be trusted to match the log.
    fn halt(&mut self, reason: String) {
        error!(error = %reason, "halting");
        let halted = reason.clone();
        self.fail_pending(|| RaftError::Halted(halted.clone()));
        self.halted = Some(reason);
    }

    fn fail_pending<F: Fn() -> RaftError>(&mut self, err: F) {
        for (_, waiter) in std::mem::take(&mut self.pending) {
            let _ = waiter.send(Err(err()));
        }
    }

    fn wake_peers(&self) {
        for peer in self.peers.values() {
            peer.wake();
        }
    }

    /// The state machine was just recovered from `snapshot`, so whatever was
    /// applied past it is gone too.
    fn adopt_snapshot(&mut self, snapshot: &Snapshot) {
        self.last_applied = snapshot.last_index;
        self.membership = snapshot.membership();
    }

    fn take_snapshot(&mut self) -> Result<Arc<Snapshot>> {
        if let Some(reason) = &self.halted {
            return Err(RaftError::Halted(reason.clone()));
        }
        let Core {
            snapshots,
            log,
            state_machine,
            membership,
            ..
        } = self;
        snapshots.take(log, &**state_machine, membership)
    }

    fn replication(&self) -> Vec<PeerProgress> {
        let mut progress: Vec<PeerProgress> = self
            .peers
            .values()
            .map(|p| PeerProgress {
                name: p.info.name.clone(),
                next_index: p.next_index,
                match_index: p.match_index,
            })
            .collect();
        progress.sort_by(|a, b| a.name.cmp(&b.name));
        progress
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            name: self.name.clone(),
            role: self.role,
            term: self.term,
            leader: self.leader.clone(),
            commit_index: self.log.commit_index(),
            last_applied: self.last_applied,
            start_index: self.log.start_index(),
            start_term: self.log.start_term(),
            last_log_index: self.log.last_index(),
            log_len: self.log.len(),
            members: self.membership.to_peer_list(),
            snapshot: self.snapshots.current().map(|s| s.summary()),
            replication: self.replication(),
            storage_bytes: self.storage.size_on_disk().unwrap_or(0),
            halted: self.halted.is_some(),
        }
    }
}

impl RaftServer {
    /// Builds a server around its collaborators. The term and vote are read
    /// back from storage; the log stays empty until [`RaftServer::recover`],
    /// [`RaftServer::load_snapshot`] or [`RaftServer::replay_log`] runs.
    pub fn new(
        name: impl Into<NodeId>,
        addr: impl Into<String>,
        settings: RaftSettings,
        storage: SledStorage,
        state_machine: Box<dyn StateMachine>,
        transporter: Arc<dyn Transporter>,
    ) -> Result<Self> {
        let name = name.into();
        let hard_state = storage.load_hard_state()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let core = Core {
            name: name.clone(),
            addr: addr.into(),
            storage: storage.clone(),
            role: Role::Follower,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            leader: None,
            log: LogStore::new(storage.clone()),
            snapshots: SnapshotManager::new(storage),
            state_machine,
            membership: ClusterConfig::new(),
            peers: HashMap::new(),
            pending: BTreeMap::new(),
            last_applied: 0,
            halted: None,
            last_heard: Instant::now(),
            election_timeout: settings.random_election_timeout(),
            settings: settings.clone(),
        };

        Ok(Self {
            inner: Arc::new(ServerInner {
                name,
                settings,
                transporter,
                core: Mutex::new(core),
                shutdown_tx,
                shutdown_rx,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.shutdown_rx.borrow()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(RaftError::Shutdown);
        }
        Ok(())
    }

    /// Makes a fresh node the leader of term 1 and sole member of a new
    /// cluster. Does nothing on a node that already has history.
    pub async fn initialize(&self) -> Result<()> {
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        if core.term > 0 || core.log.last_index() > 0 {
            warn!(term = core.term, "initialize skipped, node already has history");
            return Ok(());
        }

        core.term = 1;
        core.voted_for = Some(core.name.clone());
        core.persist_hard_state()?;
        core.membership.insert(core.name.clone(), core.addr.clone());
        core.role = Role::Leader;
        core.leader = Some(core.name.clone());
        info!(name = %core.name, "initialized new cluster");
        self.reconcile_peers(core);
        Ok(())
    }

    /// Restart path: install the persisted snapshot if there is one, then
    /// replay the persisted entries above it.
    pub async fn recover(&self) -> Result<()> {
        match self.load_snapshot().await {
            Ok(()) => {}
            Err(e) if e.is_no_snapshot() => debug!("no snapshot on disk, starting from an empty log"),
            Err(e) => return Err(e),
        }
        self.replay_log().await?;
        Ok(())
    }

    pub async fn load_snapshot(&self) -> Result<()> {
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        let snapshot = match core.snapshots.load(&mut core.log, &mut *core.state_machine) {
            Ok(snapshot) => snapshot,
            Err(RaftError::StateMachine(reason)) => {
                core.halt(reason.clone());
                return Err(RaftError::StateMachine(reason));
            }
            Err(e) => return Err(e),
        };
        core.adopt_snapshot(&snapshot);
        self.reconcile_peers(core);
        Ok(())
    }

    pub async fn replay_log(&self) -> Result<usize> {
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        let count = core.log.replay()?;
        self.after_commit(core);
        info!(
            entries = count,
            start_index = core.log.start_index(),
            commit_index = core.log.commit_index(),
            "log replayed"
        );
        Ok(count)
    }

    /// Spawns the election/heartbeat ticker.
    pub fn start(&self) {
        let server = self.clone();
        let mut shutdown_rx = self.inner.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(server.inner.settings.heartbeat_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = server.tick().await {
                            warn!(error = %e, "tick failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
            debug!(name = %server.inner.name, "ticker stopped");
        });
    }

    pub async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let mut core = self.inner.core.lock().await;
        core.peers.clear();
        core.role = Role::Follower;
        core.fail_pending(|| RaftError::Shutdown);
        info!(name = %self.inner.name, "server stopped");
    }

    async fn tick(&self) -> Result<()> {
        let election = {
            let mut guard = self.inner.core.lock().await;
            let core = &mut *guard;
            match core.role {
                Role::Leader => {
                    self.check_leader_lease(core)?;
                    self.maybe_snapshot(core);
                    None
                }
                Role::Candidate | Role::Follower if core.can_campaign() && core.election_due() => {
                    let req = core.become_candidate()?;
                    let peers: Vec<PeerInfo> = core.membership.peers_of(&core.name).collect();
                    Some((req, peers, core.membership.quorum()))
                }
                Role::Follower => {
                    self.maybe_snapshot(core);
                    None
                }
                Role::Candidate => None,
            }
        };

        if let Some((req, peers, quorum)) = election {
            self.run_election(req, peers, quorum).await?;
        }
        Ok(())
    }

    async fn run_election(&self, req: VoteRequest, peers: Vec<PeerInfo>, quorum: usize) -> Result<()> {
        let term = req.term;
        let mut votes = 1;

        if votes >= quorum {
            let mut guard = self.inner.core.lock().await;
            let core = &mut *guard;
            if core.role == Role::Candidate && core.term == term {
                self.become_leader(core)?;
            }
            return Ok(());
        }

        let mut calls = JoinSet::new();
        for peer in peers {
            let transporter = self.inner.transporter.clone();
            let req = req.clone();
            let timeout = self.inner.settings.rpc_timeout();
            calls.spawn(async move {
                let result =
                    tokio::time::timeout(timeout, transporter.send_vote_request(&peer, req)).await;
                (peer.name, result)
            });
        }

        while let Some(joined) = calls.join_next().await {
            let Ok((peer, result)) = joined else {
                continue;
            };
            let resp = match result {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "vote request failed");
                    continue;
                }
                Err(_) => {
                    debug!(%peer, "vote request timed out");
                    continue;
                }
            };

            let mut guard = self.inner.core.lock().await;
            let core = &mut *guard;
            if core.role != Role::Candidate || core.term != term {
                return Ok(());
            }
            if resp.term > core.term {
                core.step_down(resp.term)?;
                return Ok(());
            }
            if resp.vote_granted {
                votes += 1;
                debug!(%peer, votes, quorum, "vote granted");
                if votes >= quorum {
                    self.become_leader(core)?;
                    return Ok(());
                }
            }
        }
        debug!(term, votes, quorum, "election did not reach a quorum");
        Ok(())
    }

    fn become_leader(&self, core: &mut Core) -> Result<()> {
        core.role = Role::Leader;
        core.leader = Some(core.name.clone());
        info!(term = core.term, "became leader");

        self.reconcile_peers(core);
        core.append_command(Command::NoOp)?;
        if core.advance_leader_commit()? {
            self.after_commit(core);
        }
        core.wake_peers();
        Ok(())
    }

    /// A leader that cannot hear from a quorum within the election timeout
    /// gives up leadership.
    fn check_leader_lease(&self, core: &mut Core) -> Result<()> {
        if core.membership.len() <= 1 {
            return Ok(());
        }
        let window = self.inner.settings.election_timeout_max();
        let me = usize::from(core.membership.contains(&core.name));
        let acked = me
            + core
                .peers
                .values()
                .filter(|p| p.last_ack.elapsed() < window)
                .count();
        if acked < core.membership.quorum() {
            warn!(acked, quorum = core.membership.quorum(), "lost contact with quorum");
            let term = core.term;
            core.step_down(term)?;
        }
        Ok(())
    }

    fn maybe_snapshot(&self, core: &mut Core) {
        let threshold = self.inner.settings.snapshot_threshold;
        if threshold == 0 || core.halted.is_some() || core.log.compactable_len() < threshold {
            return;
        }
        if let Err(e) = core.take_snapshot() {
            warn!(error = %e, "automatic snapshot failed");
        }
    }

    /// Starts replicators for new members and drops those of departed ones.
    /// Anything but a leader runs none.
    pub(crate) fn reconcile_peers(&self, core: &mut Core) {
        if core.role != Role::Leader {
            core.peers.clear();
            return;
        }
        if !core.membership.contains(&core.name) && !core.membership.is_empty() {
            warn!("removed from the cluster configuration, stepping down");
            core.role = Role::Follower;
            core.leader = None;
            core.peers.clear();
            core.fail_pending(|| RaftError::NotLeader { leader: None });
            return;
        }

        let desired: Vec<PeerInfo> = core.membership.peers_of(&core.name).collect();
        core.peers
            .retain(|name, _| desired.iter().any(|p| &p.name == name));

        for peer in desired {
            if core.peers.contains_key(&peer.name) {
                continue;
            }
            let next_index = core.log.last_index() + 1;
            debug!(peer = %peer.name, next_index, "starting replicator");
            let state = PeerReplicator::spawn(self.clone(), peer.clone(), core.term, next_index);
            core.peers.insert(peer.name, state);
        }
    }

    pub(crate) fn after_commit(&self, core: &mut Core) {
        if core.apply_committed() {
            self.reconcile_peers(core);
        }
    }

    /// Appends `command`, waits until a quorum holds it and it has been
    /// applied locally, and returns its log index.
    pub async fn do_command(&self, command: Command) -> Result<u64> {
        self.ensure_running()?;
        let (index, rx) = {
            let mut guard = self.inner.core.lock().await;
            let core = &mut *guard;
            if let Some(reason) = &core.halted {
                return Err(RaftError::Halted(reason.clone()));
            }
            if core.role != Role::Leader {
                return Err(RaftError::NotLeader {
                    leader: core.leader.clone(),
                });
            }

            let index = core.append_command(command)?;
            let (tx, rx) = oneshot::channel();
            core.pending.insert(index, tx);
            if core.advance_leader_commit()? {
                self.after_commit(core);
            }
            core.wake_peers();
            (index, rx)
        };

        match tokio::time::timeout(self.inner.settings.command_timeout(), rx).await {
            Ok(Ok(result)) => result.map(|()| index),
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => {
                self.inner.core.lock().await.pending.remove(&index);
                Err(RaftError::CommandTimeout { index })
            }
        }
    }

    pub async fn submit(&self, payload: Vec<u8>) -> Result<u64> {
        self.do_command(Command::Payload(payload)).await
    }

    pub async fn join(&self, name: impl Into<NodeId>, addr: impl Into<String>) -> Result<u64> {
        self.do_command(Command::Join {
            name: name.into(),
            addr: addr.into(),
        })
        .await
    }

    pub async fn leave(&self, name: impl Into<NodeId>) -> Result<u64> {
        self.do_command(Command::Leave { name: name.into() }).await
    }

    pub async fn take_snapshot(&self) -> Result<Arc<Snapshot>> {
        self.inner.core.lock().await.take_snapshot()
    }

    pub async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.ensure_running()?;
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;

        if req.term < core.term {
            return Ok(VoteResponse {
                term: core.term,
                vote_granted: false,
            });
        }
        if req.term > core.term && core.hears_leader() {
            debug!(candidate = %req.candidate_name, term = req.term, "ignoring vote request, leader is alive");
            return Ok(VoteResponse {
                term: core.term,
                vote_granted: false,
            });
        }
        if req.term > core.term {
            core.step_down(req.term)?;
        }

        let up_to_date = (req.last_log_term, req.last_log_index)
            >= (core.log.last_term(), core.log.last_index());
        let free = core
            .voted_for
            .as_ref()
            .map_or(true, |v| *v == req.candidate_name);
        let granted = up_to_date && free && core.role == Role::Follower;

        if granted {
            core.voted_for = Some(req.candidate_name.clone());
            core.persist_hard_state()?;
            core.reset_election_timer();
        }
        debug!(
            candidate = %req.candidate_name,
            term = req.term,
            granted,
            "vote requested"
        );
        Ok(VoteResponse {
            term: core.term,
            vote_granted: granted,
        })
    }

    pub async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.ensure_running()?;
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        if let Some(reason) = &core.halted {
            return Err(RaftError::Halted(reason.clone()));
        }

        let reject = |core: &Core, index: u64| AppendEntriesResponse {
            term: core.term,
            success: false,
            index,
            commit_index: core.log.commit_index(),
        };

        if req.term < core.term {
            return Ok(reject(core, core.log.last_index()));
        }
        if req.term > core.term || core.role != Role::Follower {
            core.step_down(req.term)?;
        }
        core.leader = Some(req.leader_name.clone());
        core.reset_election_timer();

        let AppendEntriesRequest {
            mut prev_log_index,
            mut prev_log_term,
            mut entries,
            commit_index: leader_commit,
            ..
        } = req;

        let start_index = core.log.start_index();
        if prev_log_index < start_index {
            entries.retain(|e| e.index > start_index);
            prev_log_index = start_index;
            prev_log_term = core.log.start_term();
        }

        match core.log.term_at(prev_log_index)? {
            None => return Ok(reject(core, core.log.last_index())),
            Some(term) if term != prev_log_term => {
                debug!(prev_log_index, term, prev_log_term, "log mismatch");
                return Ok(reject(core, prev_log_index.saturating_sub(1)));
            }
            Some(_) => {}
        }

        let last_new = prev_log_index + entries.len() as u64;
        let present = entries
            .iter()
            .take_while(|e| matches!(core.log.term_at(e.index), Ok(Some(t)) if t == e.term))
            .count();
        let fresh = entries.split_off(present);
        if !fresh.is_empty() {
            match core.log.append(fresh) {
                Ok(()) => {}
                Err(RaftError::Conflict { index, commit_index }) => {
                    warn!(index, commit_index, "leader tried to rewrite committed entries");
                    return Ok(reject(core, commit_index));
                }
                Err(e) => return Err(e),
            }
        }

        if leader_commit > core.log.commit_index() && core.log.set_commit_index(leader_commit.min(last_new))? {
            self.after_commit(core);
        }

        Ok(AppendEntriesResponse {
            term: core.term,
            success: true,
            index: last_new,
            commit_index: core.log.commit_index(),
        })
    }

    /// Receiver side of a snapshot transfer.
    pub async fn snapshot_recovery(&self, req: SnapshotRequest) -> Result<SnapshotResponse> {
        self.ensure_running()?;
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        if let Some(reason) = &core.halted {
            return Err(RaftError::Halted(reason.clone()));
        }

        if req.term > core.term || (req.term == core.term && core.role != Role::Follower) {
            core.step_down(req.term)?;
        }
        if req.term == core.term {
            core.leader = Some(req.leader_name.clone());
            core.reset_election_timer();
        }

        let term = core.term;
        let previous = core.snapshots.current();
        let resp = match core.snapshots.install_remote(
            term,
            req,
            &mut core.log,
            &mut *core.state_machine,
        ) {
            Ok(resp) => resp,
            Err(RaftError::StateMachine(reason)) => {
                core.halt(reason.clone());
                return Err(RaftError::StateMachine(reason));
            }
            Err(e) => return Err(e),
        };

        let installed = core
            .snapshots
            .current()
            .filter(|s| !previous.as_ref().is_some_and(|p| Arc::ptr_eq(p, s)));
        if let Some(snapshot) = installed {
            core.adopt_snapshot(&snapshot);
        }
        Ok(resp)
    }

    pub(crate) async fn handle_append_response(
        &self,
        peer: &str,
        term: u64,
        prev_log_index: u64,
        sent: u64,
        resp: AppendEntriesResponse,
    ) -> Round {
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        if core.role != Role::Leader || core.term != term {
            return Round::Stop;
        }
        if resp.term > core.term {
            if let Err(e) = core.step_down(resp.term) {
                error!(error = %e, "failed to persist term while stepping down");
            }
            return Round::Stop;
        }

        let last_index = core.log.last_index();
        let Some(state) = core.peers.get_mut(peer) else {
            return Round::Stop;
        };
        state.last_ack = Instant::now();

        if !resp.success {
            let next = state
                .next_index
                .saturating_sub(1)
                .min(resp.index + 1)
                .max(1);
            debug!(%peer, next_index = next, "append rejected, backing off");
            state.next_index = next;
            return Round::Again;
        }

        let matched = prev_log_index + sent;
        state.match_index = state.match_index.max(matched);
        state.next_index = state.match_index + 1;
        let more = state.next_index <= last_index;

        match core.advance_leader_commit() {
            Ok(true) => {
                self.after_commit(core);
                core.wake_peers();
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to advance commit index"),
        }

        if more {
            Round::Again
        } else {
            Round::Idle
        }
    }

    pub(crate) async fn handle_snapshot_response(
        &self,
        peer: &str,
        term: u64,
        resp: SnapshotResponse,
    ) -> Round {
        let mut guard = self.inner.core.lock().await;
        let core = &mut *guard;
        if core.role != Role::Leader || core.term != term {
            return Round::Stop;
        }
        if resp.term > core.term {
            if let Err(e) = core.step_down(resp.term) {
                error!(error = %e, "failed to persist term while stepping down");
            }
            return Round::Stop;
        }

        let last_index = core.log.last_index();
        let Some(state) = core.peers.get_mut(peer) else {
            return Round::Stop;
        };
        state.last_ack = Instant::now();

        if !resp.success {
            return Round::Idle;
        }
        info!(%peer, commit_index = resp.commit_index, "peer caught up from snapshot");
        state.match_index = state.match_index.max(resp.commit_index);
        state.next_index = resp.commit_index + 1;
        let more = state.next_index <= last_index;

        match core.advance_leader_commit() {
            Ok(true) => self.after_commit(core),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to advance commit index"),
        }

        if more {
            Round::Again
        } else {
            Round::Idle
        }
    }

    pub async fn status(&self) -> NodeStatus {
        self.inner.core.lock().await.status()
    }

    pub async fn commit_info(&self) -> (u64, u64) {
        self.inner.core.lock().await.log.commit_info()
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.core.lock().await.role == Role::Leader
    }

    pub async fn leader(&self) -> Option<NodeId> {
        self.inner.core.lock().await.leader.clone()
    }

    pub async fn current_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.core.lock().await.snapshots.current()
    }
}
