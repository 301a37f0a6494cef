use crate::replicator::{AppendEntriesRequest, RaftServer, SnapshotRequest, VoteRequest};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

/// Peer-to-peer endpoints. Paths match what [`crate::replicator::HttpTransporter`]
/// posts to.
pub fn create_raft_router(server: RaftServer) -> Router {
    Router::new()
        .route("/raft/vote", post(handle_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/snapshot", post(handle_snapshot))
        .with_state(server)
}

async fn handle_vote(
    State(server): State<RaftServer>,
    Json(req): Json<VoteRequest>,
) -> impl IntoResponse {
    match server.request_vote(req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => rpc_error(e),
    }
}

async fn handle_append_entries(
    State(server): State<RaftServer>,
    Json(req): Json<AppendEntriesRequest>,
) -> impl IntoResponse {
    match server.append_entries(req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => rpc_error(e),
    }
}

async fn handle_snapshot(
    State(server): State<RaftServer>,
    Json(req): Json<SnapshotRequest>,
) -> impl IntoResponse {
    match server.snapshot_recovery(req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => rpc_error(e),
    }
}

fn rpc_error(e: crate::error::RaftError) -> axum::response::Response {
    let status = match e {
        crate::error::RaftError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}
