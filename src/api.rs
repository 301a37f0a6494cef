use crate::daemon::FlockDaemon;
use crate::error::RaftError;
use crate::replicator::KvCommand;
use crate::types::ClusterConfig;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn create_router(daemon: Arc<FlockDaemon>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/kv/:key", get(get_key).put(put_key).delete(delete_key))
        .route("/cluster/join", post(join_cluster))
        .route("/cluster/leave", post(leave_cluster))
        .route("/snapshot", post(take_snapshot))
        .with_state(daemon)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_status(State(daemon): State<Arc<FlockDaemon>>) -> impl IntoResponse {
    Json(daemon.server().status().await)
}

#[derive(Serialize)]
struct KvEntry {
    key: String,
    value: String,
}

async fn get_key(
    State(daemon): State<Arc<FlockDaemon>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match daemon.kv().get(&key) {
        Some(value) => (StatusCode::OK, Json(KvEntry { key, value })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no such key: {}", key) })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct PutKeyRequest {
    value: String,
}

async fn put_key(
    State(daemon): State<Arc<FlockDaemon>>,
    Path(key): Path<String>,
    Json(req): Json<PutKeyRequest>,
) -> impl IntoResponse {
    let command = KvCommand::Put {
        key,
        value: req.value,
    };
    match daemon.server().submit(command.encode()).await {
        Ok(index) => (StatusCode::OK, Json(serde_json::json!({ "index": index }))).into_response(),
        Err(e) => error_response(&daemon, e).await,
    }
}

async fn delete_key(
    State(daemon): State<Arc<FlockDaemon>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match daemon.server().submit(KvCommand::Delete { key }.encode()).await {
        Ok(index) => (StatusCode::OK, Json(serde_json::json!({ "index": index }))).into_response(),
        Err(e) => error_response(&daemon, e).await,
    }
}

#[derive(Deserialize)]
struct JoinRequest {
    name: String,
    addr: String,
}

async fn join_cluster(
    State(daemon): State<Arc<FlockDaemon>>,
    Json(req): Json<JoinRequest>,
) -> impl IntoResponse {
    let status = daemon.server().status().await;
    if status.members.iter().any(|m| m.name == req.name && m.addr == req.addr) {
        return (StatusCode::OK, Json(serde_json::json!({ "index": status.commit_index })))
            .into_response();
    }
    match daemon.server().join(req.name, req.addr).await {
        Ok(index) => (StatusCode::OK, Json(serde_json::json!({ "index": index }))).into_response(),
        Err(e) => error_response(&daemon, e).await,
    }
}

#[derive(Deserialize)]
struct LeaveRequest {
    name: String,
}

async fn leave_cluster(
    State(daemon): State<Arc<FlockDaemon>>,
    Json(req): Json<LeaveRequest>,
) -> impl IntoResponse {
    match daemon.server().leave(req.name).await {
        Ok(index) => (StatusCode::OK, Json(serde_json::json!({ "index": index }))).into_response(),
        Err(e) => error_response(&daemon, e).await,
    }
}

async fn take_snapshot(State(daemon): State<Arc<FlockDaemon>>) -> impl IntoResponse {
    match daemon.server().take_snapshot().await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot.summary())).into_response(),
        Err(e) => error_response(&daemon, e).await,
    }
}

/// Non-leaders answer 409 with the leader's name and address so clients can
/// retry there.
async fn error_response(daemon: &FlockDaemon, e: RaftError) -> Response {
    let status = match &e {
        RaftError::NotLeader { leader } => {
            let leader_addr = match leader {
                Some(name) => {
                    let status = daemon.server().status().await;
                    ClusterConfig::from_peer_list(&status.members)
                        .addr_of(name)
                        .map(str::to_string)
                }
                None => None,
            };
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": e.to_string(),
                    "leader": leader,
                    "leader_addr": leader_addr,
                })),
            )
                .into_response();
        }
        RaftError::CommandTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RaftError::Halted(_) | RaftError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        RaftError::InvalidCompaction { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}
