use flockraft::replicator::*;
use flockraft::testing::*;
use flockraft::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn serve(server: RaftServer) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, create_raft_router(server)).await.unwrap();
    });
    addr
}

fn follower(state_machine: RecordingStateMachine) -> RaftServer {
    RaftServer::new(
        "follower",
        "follower",
        test_settings(),
        SledStorage::temporary().unwrap(),
        Box::new(state_machine),
        Arc::new(LocalTransporter::new()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_rpcs_round_trip_over_http() {
    let state_machine = RecordingStateMachine::new();
    let server = follower(state_machine.clone());
    let peer = PeerInfo {
        name: "follower".to_string(),
        addr: serve(server.clone()).await,
    };
    let transporter = HttpTransporter::new(Duration::from_secs(2)).unwrap();

    let vote = transporter
        .send_vote_request(
            &peer,
            VoteRequest {
                term: 1,
                candidate_name: "leader".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            },
        )
        .await
        .unwrap();
    assert!(vote.vote_granted);
    assert_eq!(vote.term, 1);

    let append = transporter
        .send_append_entries(
            &peer,
            AppendEntriesRequest {
                term: 1,
                leader_name: "leader".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![
                    LogEntry::new(
                        1,
                        1,
                        Command::Join {
                            name: "leader".to_string(),
                            addr: "leader".to_string(),
                        },
                    ),
                    LogEntry::new(2, 1, Command::Payload(vec![7])),
                ],
                commit_index: 2,
            },
        )
        .await
        .unwrap();
    assert!(append.success);
    assert_eq!(append.index, 2);
    assert_eq!(append.commit_index, 2);
    assert_eq!(state_machine.applied(), vec![vec![7]]);

    let installed = transporter
        .send_snapshot_request(
            &peer,
            SnapshotRequest {
                term: 1,
                leader_name: "leader".to_string(),
                last_index: 5,
                last_term: 1,
                peers: vec![PeerInfo {
                    name: "leader".to_string(),
                    addr: "leader".to_string(),
                }],
                state: vec![0xAB, 0xCD],
            },
        )
        .await
        .unwrap();
    assert!(installed.success);
    assert_eq!(installed.commit_index, 5);
    assert_eq!(state_machine.recovered(), vec![vec![0xAB, 0xCD]]);

    let status = server.status().await;
    assert_eq!(status.leader.as_deref(), Some("leader"));
    assert_eq!(status.start_index, 5);
}

#[tokio::test]
async fn test_stopped_server_answers_with_error_status() {
    let server = follower(RecordingStateMachine::new());
    let peer = PeerInfo {
        name: "follower".to_string(),
        addr: serve(server.clone()).await,
    };
    server.stop().await;

    let transporter = HttpTransporter::new(Duration::from_secs(2)).unwrap();
    let err = transporter
        .send_vote_request(
            &peer,
            VoteRequest {
                term: 1,
                candidate_name: "leader".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Http(_)), "{err:?}");
}

#[tokio::test]
async fn test_unreachable_peer() {
    // grab a free port, then close it again
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let peer = PeerInfo {
        name: "gone".to_string(),
        addr,
    };

    let transporter = HttpTransporter::new(Duration::from_secs(2)).unwrap();
    let err = transporter
        .send_append_entries(
            &peer,
            AppendEntriesRequest {
                term: 1,
                leader_name: "leader".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                commit_index: 0,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Unreachable("gone".to_string()));
}
