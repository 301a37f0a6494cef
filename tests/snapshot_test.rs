use async_trait::async_trait;
use flockraft::replicator::*;
use flockraft::testing::*;
use flockraft::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn storage() -> SledStorage {
    SledStorage::temporary().unwrap()
}

/// Delivers through a `LocalTransporter` and notes what each peer was sent.
#[derive(Clone, Default)]
struct RecordingTransporter {
    local: LocalTransporter,
    appends: Arc<Mutex<Vec<(String, u64)>>>,
    snapshots: Arc<Mutex<Vec<(String, SnapshotResponse)>>>,
}

impl RecordingTransporter {
    fn spawn(&self, name: &str, state_machine: RecordingStateMachine) -> RaftServer {
        let server = RaftServer::new(
            name,
            name,
            test_settings(),
            storage(),
            Box::new(state_machine),
            Arc::new(self.clone()),
        )
        .unwrap();
        self.local.register(server.clone());
        server.start();
        server
    }

    fn append_prev_indexes(&self, peer: &str) -> Vec<u64> {
        self.appends
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == peer)
            .map(|(_, prev)| *prev)
            .collect()
    }

    fn snapshot_responses(&self, peer: &str) -> Vec<SnapshotResponse> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == peer)
            .map(|(_, resp)| resp.clone())
            .collect()
    }
}

#[async_trait]
impl Transporter for RecordingTransporter {
    async fn send_vote_request(
        &self,
        peer: &PeerInfo,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        self.local.send_vote_request(peer, req).await
    }

    async fn send_append_entries(
        &self,
        peer: &PeerInfo,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        self.appends
            .lock()
            .unwrap()
            .push((peer.name.clone(), req.prev_log_index));
        self.local.send_append_entries(peer, req).await
    }

    async fn send_snapshot_request(
        &self,
        peer: &PeerInfo,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse, TransportError> {
        let resp = self.local.send_snapshot_request(peer, req).await?;
        self.snapshots
            .lock()
            .unwrap()
            .push((peer.name.clone(), resp.clone()));
        Ok(resp)
    }
}

#[tokio::test]
async fn test_take_and_send_snapshot() {
    let transporter = RecordingTransporter::default();
    let state_machine = RecordingStateMachine::with_state(vec![0x8]);

    let servers: Vec<RaftServer> = ["1", "2", "3"]
        .into_iter()
        .map(|name| transporter.spawn(name, state_machine.clone()))
        .collect();
    let leader = servers[0].clone();
    leader.initialize().await.unwrap();

    for name in ["1", "2", "3"] {
        leader.join(name, name).await.unwrap();
    }

    let index = leader.submit(b"foo".to_vec()).await.unwrap();
    assert_eq!(index, 4);

    let snapshot = leader.take_snapshot().await.unwrap();
    assert_eq!(snapshot.last_index, 4);
    assert_eq!(snapshot.state, vec![0x8]);

    let status = leader.status().await;
    assert_eq!(status.log_len, 0);
    assert_eq!(status.start_index, 4);
    assert_eq!(status.start_term, 1);
    assert_eq!(leader.commit_info().await, (4, 1));

    // a fourth node only ever sees the snapshot and what follows it
    let newcomer = transporter.spawn("4", state_machine.clone());
    assert_eq!(leader.join("4", "4").await.unwrap(), 5);

    assert!(
        wait_until(&newcomer, WAIT, |s| s.start_index == 4
            && s.start_term == 1
            && s.commit_index >= 5)
        .await
    );
    let status = newcomer.status().await;
    assert_eq!(status.members.len(), 4);
    assert_eq!(status.last_applied, 5);
    assert!(state_machine.recovered().contains(&vec![0x8]));

    // the transfer reported the snapshot boundary back as the match point
    let responses = transporter.snapshot_responses("4");
    assert!(!responses.is_empty());
    assert!(responses
        .iter()
        .all(|r| r.success && r.commit_index == snapshot.last_index));
    assert!(
        wait_until(&leader, WAIT, |s| s
            .replication
            .iter()
            .any(|p| p.name == "4" && p.match_index == s.commit_index))
        .await
    );

    // nothing below the compacted prefix was ever shipped as entries
    let prevs = transporter.append_prev_indexes("4");
    assert!(!prevs.is_empty());
    assert!(prevs.iter().all(|prev| *prev >= snapshot.last_index), "{prevs:?}");

    let status = leader.status().await;
    assert_eq!(status.start_index, 4);
    assert_eq!(status.start_term, 1);

    for server in servers.iter().chain([&newcomer]) {
        server.stop().await;
    }
}

#[tokio::test]
async fn test_reloading_snapshot_reapplies_newer_entries() {
    let state_machine = RecordingStateMachine::new();
    let server = RaftServer::new(
        "1",
        "1",
        test_settings(),
        storage(),
        Box::new(state_machine.clone()),
        Arc::new(LocalTransporter::new()),
    )
    .unwrap();
    server.initialize().await.unwrap();
    server.submit(vec![1]).await.unwrap();
    server.take_snapshot().await.unwrap();
    server.submit(vec![2]).await.unwrap();

    // the state machine goes back to the snapshot, and so does the applied point
    server.load_snapshot().await.unwrap();
    let status = server.status().await;
    assert_eq!(status.last_applied, 1);
    assert_eq!(state_machine.recovered(), vec![vec![1]]);

    server.replay_log().await.unwrap();
    let status = server.status().await;
    assert_eq!(status.start_index, 1);
    assert_eq!(status.commit_index, 2);
    assert_eq!(status.last_applied, 2);
    assert_eq!(state_machine.applied(), vec![vec![1], vec![2], vec![2]]);
}

#[tokio::test]
async fn test_failed_snapshot_install_halts_node() {
    let state_machine = RecordingStateMachine::new();
    let storage = storage();
    let server = RaftServer::new(
        "follower",
        "follower",
        test_settings(),
        storage.clone(),
        Box::new(state_machine.clone()),
        Arc::new(LocalTransporter::new()),
    )
    .unwrap();

    state_machine.fail_recover(true);
    let req = SnapshotRequest {
        term: 1,
        leader_name: "leader".to_string(),
        last_index: 5,
        last_term: 1,
        peers: vec![],
        state: vec![0xAB],
    };
    let err = server.snapshot_recovery(req).await.unwrap_err();
    assert!(matches!(err, RaftError::StateMachine(_)));

    let status = server.status().await;
    assert!(status.halted);
    assert_eq!(status.start_index, 0);
    assert!(status.snapshot.is_none());
    assert!(storage.load_snapshot().unwrap().is_none());

    let append = AppendEntriesRequest {
        term: 1,
        leader_name: "leader".to_string(),
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![LogEntry::new(1, 1, Command::Payload(vec![9]))],
        commit_index: 1,
    };
    assert!(matches!(
        server.append_entries(append).await.unwrap_err(),
        RaftError::Halted(_)
    ));
    assert!(state_machine.applied().is_empty());
}

#[tokio::test]
async fn test_start_from_snapshot() {
    let blob = vec![0x60, 0x61, 0x62, 0x63, 0x64, 0x65];
    let transporter = LocalTransporter::new();
    let state_machine = RecordingStateMachine::with_state(blob.clone());
    let storage = storage();

    let server = spawn_local_server(
        "1",
        &transporter,
        state_machine.clone(),
        storage.clone(),
        test_settings(),
    )
    .unwrap();
    server.initialize().await.unwrap();
    server.submit(b"foo".to_vec()).await.unwrap();
    server.take_snapshot().await.unwrap();

    let status = server.status().await;
    assert_eq!(status.log_len, 0);
    assert_eq!(status.start_index, 1);
    assert_eq!(status.start_term, 1);
    server.stop().await;
    transporter.unregister("1");

    let restarted = RaftServer::new(
        "1",
        "1",
        test_settings(),
        storage,
        Box::new(state_machine.clone()),
        Arc::new(transporter.clone()),
    )
    .unwrap();
    restarted.replay_log().await.unwrap();

    let status = restarted.status().await;
    assert_eq!(status.log_len, 0);
    assert_eq!(status.start_index, 0);
    assert_eq!(status.start_term, 0);
    assert_eq!(restarted.commit_info().await, (0, 0));

    restarted.load_snapshot().await.unwrap();
    let status = restarted.status().await;
    assert_eq!(status.start_index, 1);
    assert_eq!(status.start_term, 1);
    assert_eq!(restarted.commit_info().await, (1, 1));
    assert_eq!(state_machine.recovered(), vec![blob]);
}

#[tokio::test]
async fn test_load_snapshot_without_one() {
    let server = RaftServer::new(
        "1",
        "1",
        test_settings(),
        storage(),
        Box::new(RecordingStateMachine::new()),
        Arc::new(LocalTransporter::new()),
    )
    .unwrap();

    let err = server.load_snapshot().await.unwrap_err();
    assert!(err.is_no_snapshot());

    // a full recovery treats the missing snapshot as nothing to install
    server.recover().await.unwrap();
    assert_eq!(server.commit_info().await, (0, 0));
}

#[tokio::test]
async fn test_snapshot_with_nothing_committed() {
    let server = RaftServer::new(
        "1",
        "1",
        test_settings(),
        storage(),
        Box::new(RecordingStateMachine::new()),
        Arc::new(LocalTransporter::new()),
    )
    .unwrap();

    let err = server.take_snapshot().await.unwrap_err();
    assert!(matches!(err, RaftError::InvalidCompaction { .. }));
}

#[tokio::test]
async fn test_failed_save_leaves_log_untouched() {
    let transporter = LocalTransporter::new();
    let state_machine = RecordingStateMachine::new();
    let server =
        spawn_local_server("1", &transporter, state_machine.clone(), storage(), test_settings())
            .unwrap();
    server.initialize().await.unwrap();
    server.submit(vec![1]).await.unwrap();
    server.submit(vec![2]).await.unwrap();

    state_machine.fail_save(true);
    let err = server.take_snapshot().await.unwrap_err();
    assert!(matches!(err, RaftError::StateMachine(_)));

    let status = server.status().await;
    assert_eq!(status.start_index, 0);
    assert_eq!(status.log_len, 2);
    assert!(status.snapshot.is_none());
    server.stop().await;
}

#[tokio::test]
async fn test_snapshot_recovery_rules() {
    let state_machine = RecordingStateMachine::new();
    let server = RaftServer::new(
        "follower",
        "follower",
        test_settings(),
        storage(),
        Box::new(state_machine.clone()),
        Arc::new(LocalTransporter::new()),
    )
    .unwrap();

    let heartbeat = AppendEntriesRequest {
        term: 2,
        leader_name: "leader".to_string(),
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![],
        commit_index: 0,
    };
    assert!(server.append_entries(heartbeat).await.unwrap().success);

    let request = |term: u64| SnapshotRequest {
        term,
        leader_name: "leader".to_string(),
        last_index: 5,
        last_term: 2,
        peers: vec![
            PeerInfo {
                name: "leader".to_string(),
                addr: "leader".to_string(),
            },
            PeerInfo {
                name: "follower".to_string(),
                addr: "follower".to_string(),
            },
        ],
        state: vec![0xAB],
    };

    let stale = server.snapshot_recovery(request(1)).await.unwrap();
    assert!(!stale.success);
    assert_eq!(stale.term, 2);
    assert!(state_machine.recovered().is_empty());

    let installed = server.snapshot_recovery(request(2)).await.unwrap();
    assert!(installed.success);
    assert_eq!(installed.commit_index, 5);
    assert_eq!(state_machine.recovered(), vec![vec![0xAB]]);

    let status = server.status().await;
    assert_eq!(status.start_index, 5);
    assert_eq!(status.start_term, 2);
    assert_eq!(status.last_applied, 5);
    assert_eq!(status.members.len(), 2);
    assert_eq!(server.commit_info().await, (5, 2));

    // already covered by the local log: acknowledged without a second install
    let repeat = server.snapshot_recovery(request(2)).await.unwrap();
    assert!(repeat.success);
    assert_eq!(repeat.commit_index, 5);
    assert_eq!(state_machine.recovered().len(), 1);

    // entries older than the snapshot are skipped when the leader resends them
    let append = AppendEntriesRequest {
        term: 2,
        leader_name: "leader".to_string(),
        prev_log_index: 3,
        prev_log_term: 2,
        entries: vec![
            LogEntry::new(4, 2, Command::NoOp),
            LogEntry::new(5, 2, Command::NoOp),
            LogEntry::new(6, 2, Command::Payload(vec![6])),
        ],
        commit_index: 6,
    };
    let resp = server.append_entries(append).await.unwrap();
    assert!(resp.success);
    assert_eq!(resp.index, 6);
    assert_eq!(resp.commit_index, 6);
    assert_eq!(state_machine.applied(), vec![vec![6]]);
}

#[tokio::test]
async fn test_automatic_snapshot_at_threshold() {
    let transporter = LocalTransporter::new();
    let mut settings = test_settings();
    settings.snapshot_threshold = 5;

    let server = spawn_local_server(
        "1",
        &transporter,
        RecordingStateMachine::new(),
        storage(),
        settings,
    )
    .unwrap();
    server.initialize().await.unwrap();
    for i in 0..6u8 {
        server.submit(vec![i]).await.unwrap();
    }

    assert!(wait_until(&server, WAIT, |s| s.start_index >= 5 && s.snapshot.is_some()).await);
    server.stop().await;
}

#[tokio::test]
async fn test_restart_recovers_snapshot_and_tail() {
    let transporter = LocalTransporter::new();
    let storage = storage();
    let kv = SharedKv::new();

    let server = spawn_local_server(
        "1",
        &transporter,
        KvStateMachine::new(kv.clone()),
        storage.clone(),
        test_settings(),
    )
    .unwrap();
    server.initialize().await.unwrap();

    let put = |key: &str, value: &str| {
        KvCommand::Put {
            key: key.to_string(),
            value: value.to_string(),
        }
        .encode()
    };
    server.submit(put("a", "1")).await.unwrap();
    server.submit(put("b", "2")).await.unwrap();
    server.take_snapshot().await.unwrap();
    server.submit(put("c", "3")).await.unwrap();
    server
        .submit(KvCommand::Delete { key: "a".to_string() }.encode())
        .await
        .unwrap();
    server.stop().await;
    transporter.unregister("1");

    let restored = SharedKv::new();
    let restarted = RaftServer::new(
        "1",
        "1",
        test_settings(),
        storage,
        Box::new(KvStateMachine::new(restored.clone())),
        Arc::new(transporter.clone()),
    )
    .unwrap();
    restarted.recover().await.unwrap();

    assert_eq!(restored.get("a"), None);
    assert_eq!(restored.get("b").as_deref(), Some("2"));
    assert_eq!(restored.get("c").as_deref(), Some("3"));
    assert_eq!(restored.snapshot(), kv.snapshot());

    let status = restarted.status().await;
    assert_eq!(status.start_index, 2);
    assert_eq!(status.commit_index, 4);
    assert_eq!(status.last_applied, 4);
    assert_eq!(status.term, 1);
}
