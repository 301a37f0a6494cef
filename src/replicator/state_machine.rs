use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Application state driven by the replicated log.
///
/// `apply` sees committed payloads in log order. `save` must capture every
/// applied command and `recover` must replace the whole state with a blob
/// produced by `save`.
pub trait StateMachine: Send + Sync {
    fn save(&self) -> anyhow::Result<Vec<u8>>;
    fn recover(&mut self, state: &[u8]) -> anyhow::Result<()>;
    fn apply(&mut self, command: &[u8]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvCommand {
    Put { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Vec<u8> {
        // a two-variant enum of strings always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(raw: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct KvState {
    pub entries: BTreeMap<String, String>,
    pub applied: u64,
}

impl KvState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, command: &KvCommand) {
        match command {
            KvCommand::Put { key, value } => {
                self.entries.insert(key.clone(), value.clone());
            }
            KvCommand::Delete { key } => {
                self.entries.remove(key);
            }
        }
        self.applied += 1;
    }
}

/// Read handle onto the key/value state, shared with the HTTP API.
#[derive(Clone, Default)]
pub struct SharedKv {
    inner: Arc<RwLock<KvState>>,
}

impl SharedKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.read().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    pub fn snapshot(&self) -> KvState {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, KvState> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, KvState> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct KvStateMachine {
    state: SharedKv,
}

impl KvStateMachine {
    pub fn new(state: SharedKv) -> Self {
        Self { state }
    }
}

impl StateMachine for KvStateMachine {
    fn save(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&*self.state.read())?)
    }

    fn recover(&mut self, state: &[u8]) -> anyhow::Result<()> {
        let restored: KvState = serde_json::from_slice(state)?;
        *self.state.write() = restored;
        Ok(())
    }

    fn apply(&mut self, command: &[u8]) -> anyhow::Result<()> {
        let command = KvCommand::decode(command)?;
        self.state.write().apply(&command);
        Ok(())
    }
}
