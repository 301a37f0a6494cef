use chrono::Utc;
use flockraft::replicator::*;
use flockraft::*;
use tempfile::TempDir;

fn entry(index: u64, term: u64) -> LogEntry {
    LogEntry::new(index, term, Command::Payload(vec![index as u8]))
}

fn snapshot(last_index: u64, last_term: u64, state: &[u8]) -> Snapshot {
    Snapshot {
        last_index,
        last_term,
        peers: vec![PeerInfo {
            name: "1".to_string(),
            addr: "127.0.0.1:9100".to_string(),
        }],
        state: state.to_vec(),
        taken_at: Utc::now(),
    }
}

#[test]
fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("raft");

    {
        let storage = SledStorage::open(&path).unwrap();
        storage
            .append_entries(&[entry(1, 1), entry(2, 1), entry(3, 2)])
            .unwrap();
        storage
            .save_hard_state(&HardState {
                term: 2,
                voted_for: Some("node-b".to_string()),
            })
            .unwrap();
        storage.save_commit_index(2).unwrap();
        storage.save_snapshot(&snapshot(1, 1, b"state")).unwrap();
    }

    let storage = SledStorage::open(&path).unwrap();
    let entries = storage.load_entries_after(0).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2], entry(3, 2));

    let hard_state = storage.load_hard_state().unwrap();
    assert_eq!(hard_state.term, 2);
    assert_eq!(hard_state.voted_for.as_deref(), Some("node-b"));
    assert_eq!(storage.load_commit_index().unwrap(), 2);

    let loaded = storage.load_snapshot().unwrap().unwrap();
    assert_eq!(loaded.last_index, 1);
    assert_eq!(loaded.state, b"state".to_vec());
}

#[test]
fn test_fresh_storage_defaults() {
    let storage = SledStorage::temporary().unwrap();
    assert_eq!(storage.load_hard_state().unwrap(), HardState::default());
    assert_eq!(storage.load_commit_index().unwrap(), 0);
    assert!(storage.load_snapshot().unwrap().is_none());
    assert!(storage.load_entries_after(0).unwrap().is_empty());
}

#[test]
fn test_truncate_and_purge() {
    let storage = SledStorage::temporary().unwrap();
    storage
        .append_entries(&[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 1)])
        .unwrap();

    storage.truncate_from(4).unwrap();
    storage.purge_upto(1).unwrap();

    let indexes: Vec<u64> = storage
        .load_entries_after(0)
        .unwrap()
        .iter()
        .map(|e| e.index)
        .collect();
    assert_eq!(indexes, vec![2, 3]);

    assert_eq!(storage.load_entries_after(2).unwrap().len(), 1);

    storage.clear_log().unwrap();
    assert!(storage.load_entries_after(0).unwrap().is_empty());
}

#[test]
fn test_later_snapshot_supersedes_earlier() {
    let storage = SledStorage::temporary().unwrap();
    storage.save_snapshot(&snapshot(3, 1, &[1])).unwrap();
    storage.save_snapshot(&snapshot(7, 2, &[2])).unwrap();

    let current = storage.load_snapshot().unwrap().unwrap();
    assert_eq!(current.last_index, 7);
    assert_eq!(current.last_term, 2);
    assert_eq!(current.state, vec![2]);
}
