use crate::error::TransportError;
use crate::replicator::messages::{
    AppendEntriesRequest, AppendEntriesResponse, SnapshotRequest, SnapshotResponse, VoteRequest,
    VoteResponse,
};
use crate::types::PeerInfo;
use async_trait::async_trait;
use std::time::Duration;

/// Delivers RPCs to other servers. Any error is treated by the caller as "no
/// response"; a dead peer and a partition look the same.
#[async_trait]
pub trait Transporter: Send + Sync {
    async fn send_vote_request(
        &self,
        peer: &PeerInfo,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError>;

    async fn send_append_entries(
        &self,
        peer: &PeerInfo,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;

    async fn send_snapshot_request(
        &self,
        peer: &PeerInfo,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse, TransportError>;
}

pub struct HttpTransporter {
    client: reqwest::Client,
}

impl HttpTransporter {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self { client })
    }

    async fn send_rpc<Req, Resp>(
        &self,
        peer: &PeerInfo,
        path: &str,
        req: &Req,
    ) -> Result<Resp, TransportError>
    where
        Req: serde::Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("http://{}/raft/{}", peer.addr, path);

        let response = self.client.post(&url).json(req).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(peer.name.clone())
            } else if e.is_connect() {
                TransportError::Unreachable(peer.name.clone())
            } else {
                TransportError::Http(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(TransportError::Http(format!(
                "{} answered {}",
                peer.name,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Transporter for HttpTransporter {
    async fn send_vote_request(
        &self,
        peer: &PeerInfo,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        self.send_rpc(peer, "vote", &req).await
    }

    async fn send_append_entries(
        &self,
        peer: &PeerInfo,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        self.send_rpc(peer, "append_entries", &req).await
    }

    async fn send_snapshot_request(
        &self,
        peer: &PeerInfo,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse, TransportError> {
        self.send_rpc(peer, "snapshot", &req).await
    }
}
