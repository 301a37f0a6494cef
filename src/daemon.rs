use crate::config::NodeConfig;
use crate::replicator::{HttpTransporter, KvStateMachine, RaftServer, SharedKv, SledStorage};
use crate::types::NodeId;
use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const JOIN_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const JOIN_MAX_ATTEMPTS: usize = 30;

pub struct FlockDaemon {
    name: NodeId,
    addr: String,
    server: RaftServer,
    kv: SharedKv,
    config: NodeConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

#[derive(Deserialize)]
struct JoinReply {
    #[serde(default)]
    leader_addr: Option<String>,
}

impl FlockDaemon {
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let name = config.resolve_node_name()?;
        let addr = config.effective_advertise_addr();
        info!(%name, %addr, "initializing daemon");

        std::fs::create_dir_all(&config.data_dir)?;
        let storage = SledStorage::open(config.data_dir.join("raft"))?;
        let transporter = Arc::new(HttpTransporter::new(config.raft.rpc_timeout())?);

        let kv = SharedKv::new();
        let server = RaftServer::new(
            name.clone(),
            addr.clone(),
            config.raft.clone(),
            storage,
            Box::new(KvStateMachine::new(kv.clone())),
            transporter,
        )?;
        server.recover().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            name,
            addr,
            server,
            kv,
            config,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub async fn run(&self) -> Result<()> {
        self.server.start();

        let status = self.server.status().await;
        let is_member = status.members.iter().any(|m| m.name == self.name);

        if self.config.bootstrap {
            self.server.initialize().await?;
        } else if !is_member && !self.config.seeds.is_empty() {
            self.join_via_seeds().await?;
        } else if !is_member {
            warn!("not a cluster member and no seeds configured, waiting to be added");
        }

        info!(listen = %self.config.listen_addr(), "daemon running");
        self.wait_for_shutdown().await;
        self.server.stop().await;
        Ok(())
    }

    /// Asks the seeds, and any leader they point at, to admit this node until
    /// one accepts or the attempts run out.
    async fn join_via_seeds(&self) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(self.config.raft.command_timeout() + self.config.raft.rpc_timeout())
            .build()?;
        let body = serde_json::json!({ "name": self.name, "addr": self.addr });
        let mut targets: Vec<String> = self.config.seeds.clone();

        for attempt in 1..=JOIN_MAX_ATTEMPTS {
            let mut redirects = Vec::new();
            for target in &targets {
                let url = format!("http://{}/cluster/join", target);
                match client.post(&url).json(&body).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        info!(via = %target, "joined cluster");
                        return Ok(());
                    }
                    Ok(resp) if resp.status() == reqwest::StatusCode::CONFLICT => {
                        if let Ok(JoinReply { leader_addr: Some(leader) }) = resp.json().await {
                            debug!(via = %target, %leader, "redirected to leader");
                            redirects.push(leader);
                        }
                    }
                    Ok(resp) => debug!(via = %target, status = %resp.status(), "join refused"),
                    Err(e) => debug!(via = %target, error = %e, "join request failed"),
                }
            }
            for leader in redirects {
                if !targets.contains(&leader) {
                    targets.insert(0, leader);
                }
            }

            warn!(attempt, "join attempt failed, retrying");
            tokio::select! {
                _ = tokio::time::sleep(JOIN_RETRY_INTERVAL) => {}
                _ = self.wait_for_shutdown() => return Ok(()),
            }
        }
        anyhow::bail!("could not join the cluster through {:?}", self.config.seeds)
    }

    async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &RaftServer {
        &self.server
    }

    pub fn kv(&self) -> &SharedKv {
        &self.kv
    }
}
