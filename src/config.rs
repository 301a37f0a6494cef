use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_name: Option<String>,

    pub bind_addr: String,
    pub bind_port: u16,
    pub advertise_addr: Option<String>,

    pub data_dir: PathBuf,

    /// Start a brand new cluster with this node as its only member.
    pub bootstrap: bool,
    /// Addresses of existing members to ask for admission.
    pub seeds: Vec<String>,

    pub raft: RaftSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RaftSettings {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub rpc_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Committed entries kept in the log before a snapshot is taken; 0 turns
    /// automatic snapshots off.
    pub snapshot_threshold: u64,
    pub max_append_entries: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 9100,
            advertise_addr: None,
            data_dir: PathBuf::from("/var/lib/flockraft"),
            bootstrap: false,
            seeds: Vec::new(),
            raft: RaftSettings::default(),
        }
    }
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 50,
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 600,
            rpc_timeout_ms: 1000,
            command_timeout_ms: 5000,
            snapshot_threshold: 1000,
            max_append_entries: 256,
        }
    }
}

impl RaftSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be positive");
        }
        if self.election_timeout_min_ms <= self.heartbeat_interval_ms {
            anyhow::bail!("election_timeout_min_ms must exceed heartbeat_interval_ms");
        }
        if self.election_timeout_max_ms < self.election_timeout_min_ms {
            anyhow::bail!("election_timeout_max_ms must be >= election_timeout_min_ms");
        }
        if self.max_append_entries == 0 {
            anyhow::bail!("max_append_entries must be positive");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng()
            .gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);
        Duration::from_millis(ms)
    }
}

impl NodeConfig {
    pub fn load(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.raft.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The configured name, or one generated on first start and kept in the
    /// data directory so the node keeps its identity across restarts.
    pub fn resolve_node_name(&self) -> anyhow::Result<String> {
        if let Some(name) = &self.node_name {
            return Ok(name.clone());
        }
        let path = self.data_dir.join("node_name");
        if path.exists() {
            return Ok(std::fs::read_to_string(&path)?.trim().to_string());
        }
        std::fs::create_dir_all(&self.data_dir)?;
        let name = uuid::Uuid::new_v4().to_string();
        std::fs::write(&path, &name)?;
        Ok(name)
    }

    pub fn effective_advertise_addr(&self) -> String {
        self.advertise_addr.clone().unwrap_or_else(|| {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".to_string());
            format!("{}:{}", host, self.bind_port)
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }
}
