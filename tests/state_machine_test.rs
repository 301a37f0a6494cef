use flockraft::replicator::*;

fn put(key: &str, value: &str) -> KvCommand {
    KvCommand::Put {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[test]
fn test_kv_state_new() {
    let state = KvState::new();
    assert!(state.entries.is_empty());
    assert_eq!(state.applied, 0);
}

#[test]
fn test_apply_put_and_delete() {
    let mut state = KvState::new();
    state.apply(&put("a", "1"));
    state.apply(&put("b", "2"));
    state.apply(&put("a", "3"));
    state.apply(&KvCommand::Delete {
        key: "b".to_string(),
    });

    assert_eq!(state.entries.len(), 1);
    assert_eq!(state.entries.get("a").map(String::as_str), Some("3"));
    assert_eq!(state.applied, 4);
}

#[test]
fn test_delete_missing_key_still_counts() {
    let mut state = KvState::new();
    state.apply(&KvCommand::Delete {
        key: "ghost".to_string(),
    });
    assert!(state.entries.is_empty());
    assert_eq!(state.applied, 1);
}

#[test]
fn test_command_wire_format() {
    let raw = put("k", "v").encode();
    let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(json["Put"]["key"], "k");
    assert_eq!(KvCommand::decode(&raw).unwrap(), put("k", "v"));
    assert!(KvCommand::decode(b"not json").is_err());
}

#[test]
fn test_state_machine_apply_updates_shared_view() {
    let shared = SharedKv::new();
    let mut machine = KvStateMachine::new(shared.clone());

    machine.apply(&put("x", "1").encode()).unwrap();
    machine.apply(&put("y", "2").encode()).unwrap();

    assert_eq!(shared.len(), 2);
    assert_eq!(shared.get("x").as_deref(), Some("1"));
    assert!(machine.apply(b"garbage").is_err());
    assert_eq!(shared.snapshot().applied, 2);
}

#[test]
fn test_save_and_recover_replace_state() {
    let source = SharedKv::new();
    let mut machine = KvStateMachine::new(source.clone());
    machine.apply(&put("a", "1").encode()).unwrap();
    machine.apply(&put("b", "2").encode()).unwrap();
    let blob = machine.save().unwrap();

    let target = SharedKv::new();
    let mut restored = KvStateMachine::new(target.clone());
    restored.apply(&put("stale", "x").encode()).unwrap();
    restored.recover(&blob).unwrap();

    assert_eq!(target.snapshot(), source.snapshot());
    assert_eq!(target.get("stale"), None);
    assert!(restored.recover(b"{broken").is_err());
    assert_eq!(target.len(), 2);
}
