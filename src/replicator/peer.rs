use crate::replicator::messages::{AppendEntriesRequest, SnapshotRequest};
use crate::replicator::raft_node::{Core, RaftServer};
use crate::types::{PeerInfo, Role};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Leader-side bookkeeping for one follower. Dropping it stops the
/// follower's replicator.
pub(crate) struct PeerState {
    pub(crate) info: PeerInfo,
    pub(crate) next_index: u64,
    pub(crate) match_index: u64,
    pub(crate) last_ack: Instant,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl PeerState {
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }
}

impl Drop for PeerState {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// What a replicator does after one exchange with its follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Round {
    /// Leadership for this term is gone.
    Stop,
    /// More to send right away.
    Again,
    /// Wait for new entries or the next heartbeat.
    Idle,
}

enum Outgoing {
    Append {
        req: AppendEntriesRequest,
        sent: u64,
    },
    Snapshot(SnapshotRequest),
}

/// Drives one follower for one leadership term: heartbeats, log shipping and
/// snapshot transfer once the follower falls behind the compacted prefix.
pub(crate) struct PeerReplicator {
    server: RaftServer,
    peer: PeerInfo,
    term: u64,
    wake: Arc<Notify>,
}

impl PeerReplicator {
    pub(crate) fn spawn(server: RaftServer, peer: PeerInfo, term: u64, next_index: u64) -> PeerState {
        let wake = Arc::new(Notify::new());
        let replicator = PeerReplicator {
            server,
            peer: peer.clone(),
            term,
            wake: wake.clone(),
        };
        let task = tokio::spawn(replicator.run());

        PeerState {
            info: peer,
            next_index,
            match_index: 0,
            last_ack: Instant::now(),
            wake,
            task,
        }
    }

    async fn run(self) {
        let mut shutdown_rx = self.server.inner.shutdown_rx.clone();
        let heartbeat = self.server.inner.settings.heartbeat_interval();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.replicate_once().await {
                Round::Stop => break,
                Round::Again => continue,
                Round::Idle => {}
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(heartbeat) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
        debug!(peer = %self.peer.name, term = self.term, "replicator exited");
    }

    async fn replicate_once(&self) -> Round {
        let Some(outgoing) = self.prepare().await else {
            return Round::Stop;
        };
        let transporter = &self.server.inner.transporter;
        let timeout = self.server.inner.settings.rpc_timeout();

        match outgoing {
            Outgoing::Append { req, sent } => {
                let prev_log_index = req.prev_log_index;
                trace!(
                    peer = %self.peer.name,
                    prev_log_index,
                    sent,
                    heartbeat = req.is_heartbeat(),
                    "sending append entries"
                );
                match tokio::time::timeout(timeout, transporter.send_append_entries(&self.peer, req)).await {
                    Ok(Ok(resp)) => {
                        self.server
                            .handle_append_response(&self.peer.name, self.term, prev_log_index, sent, resp)
                            .await
                    }
                    Ok(Err(e)) => {
                        debug!(peer = %self.peer.name, error = %e, "append entries failed");
                        self.after_failure().await
                    }
                    Err(_) => {
                        debug!(peer = %self.peer.name, "append entries timed out");
                        self.after_failure().await
                    }
                }
            }
            Outgoing::Snapshot(req) => {
                debug!(peer = %self.peer.name, last_index = req.last_index, "sending snapshot");
                match tokio::time::timeout(timeout, transporter.send_snapshot_request(&self.peer, req)).await {
                    Ok(Ok(resp)) => {
                        self.server
                            .handle_snapshot_response(&self.peer.name, self.term, resp)
                            .await
                    }
                    Ok(Err(e)) => {
                        warn!(peer = %self.peer.name, error = %e, "snapshot transfer failed");
                        self.after_failure().await
                    }
                    Err(_) => {
                        warn!(peer = %self.peer.name, "snapshot transfer timed out");
                        self.after_failure().await
                    }
                }
            }
        }
    }

    /// Builds the next request under the core lock. `None` means this node is
    /// no longer leading `self.term` or the follower was removed.
    async fn prepare(&self) -> Option<Outgoing> {
        let mut guard = self.server.inner.core.lock().await;
        let core: &mut Core = &mut guard;
        if core.role != Role::Leader || core.term != self.term {
            return None;
        }

        let last_index = core.log.last_index();
        let start_index = core.log.start_index();
        let commit_index = core.log.commit_index();
        let current = core.snapshots.current();
        let max = self.server.inner.settings.max_append_entries;
        let name = self.server.inner.name.clone();

        let state = core.peers.get_mut(&self.peer.name)?;
        state.next_index = state.next_index.clamp(1, last_index + 1);
        let prev_log_index = state.next_index - 1;

        if prev_log_index < start_index {
            let Some(snapshot) = current else {
                warn!(peer = %state.info.name, start_index, "log compacted without a snapshot");
                return None;
            };
            return Some(Outgoing::Snapshot(SnapshotRequest::new(
                self.term, name, &snapshot,
            )));
        }

        let prev_log_term = match core.log.term_at(prev_log_index) {
            Ok(Some(term)) => term,
            _ => return None,
        };
        let entries = match core.log.get_entries_after(prev_log_index, max) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, prev_log_index, "failed to read entries for peer");
                return None;
            }
        };
        let sent = entries.len() as u64;

        Some(Outgoing::Append {
            req: AppendEntriesRequest {
                term: self.term,
                leader_name: name,
                prev_log_index,
                prev_log_term,
                entries,
                commit_index,
            },
            sent,
        })
    }

    /// After a failed exchange: retry on the next heartbeat unless the term
    /// moved on meanwhile.
    async fn after_failure(&self) -> Round {
        let core = self.server.inner.core.lock().await;
        if core.role != Role::Leader || core.term != self.term {
            return Round::Stop;
        }
        Round::Idle
    }
}
