//! HTTP API for meta node administration.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{OriginalUri, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::command::Command;
use super::store::MetaStore;
use crate::Error;

/// Upper bound on a `/data` long poll.
const DATA_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Request to add a meta node to the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// HTTP address of the joining node
    pub host: String,
    /// Cluster TCP address of the joining node
    pub tcp_host: String,
    /// Consensus id of the joining node
    pub raft_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: Option<u64>,
    pub raft_id: u64,
    pub http_addr: String,
    pub tcp_addr: String,
    pub leader: String,
    pub is_leader: bool,
    pub peers: Vec<String>,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub index: u64,
}

#[derive(Debug, Deserialize)]
struct DataQuery {
    index: Option<u64>,
}

/// Build the meta HTTP router over `store`.
pub fn router(store: Arc<MetaStore>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/status", get(status))
        .route("/join", post(join))
        .route("/remove", post(remove))
        .route("/execute", post(execute))
        .route("/data", get(data))
        .with_state(store)
}

async fn ping(State(store): State<Arc<MetaStore>>) -> Response {
    Json(serde_json::json!({ "leader": store.leader_http() })).into_response()
}

async fn status(State(store): State<Arc<MetaStore>>) -> Response {
    Json(StatusResponse {
        node_id: store.node_id(),
        raft_id: store.raft_id(),
        http_addr: store.http_addr().to_string(),
        tcp_addr: store.tcp_addr().to_string(),
        leader: store.leader_http(),
        is_leader: store.is_leader(),
        peers: store.peers(),
        index: store.index(),
    })
    .into_response()
}

async fn join(
    State(store): State<Arc<MetaStore>>,
    OriginalUri(uri): OriginalUri,
    Json(request): Json<JoinRequest>,
) -> Response {
    match store.join_meta(&request).await {
        Ok(node) => {
            info!(node_id = node.id, host = %node.host, "Meta node joined via HTTP");
            Json(node).into_response()
        }
        Err(e) => error_response(e, uri.path()),
    }
}

async fn remove(
    State(store): State<Arc<MetaStore>>,
    OriginalUri(uri): OriginalUri,
    Json(request): Json<RemoveRequest>,
) -> Response {
    match store.remove_meta(&request.host).await {
        Ok(node) => Json(node).into_response(),
        Err(e) => error_response(e, uri.path()),
    }
}

async fn execute(
    State(store): State<Arc<MetaStore>>,
    OriginalUri(uri): OriginalUri,
    Json(command): Json<Command>,
) -> Response {
    match store.execute(command).await {
        Ok(index) => Json(ExecuteResponse { index }).into_response(),
        Err(e) => error_response(e, uri.path()),
    }
}

/// Returns the topology once its index moves past `index`, or the current
/// topology when the wait times out.
async fn data(State(store): State<Arc<MetaStore>>, Query(query): Query<DataQuery>) -> Response {
    if let Some(index) = query.index {
        let wait = store.after_index(index);
        if !wait.is_complete() {
            match tokio::time::timeout(DATA_POLL_TIMEOUT, wait.wait()).await {
                Ok(Err(e)) => return error_response(e, "/data"),
                Ok(Ok(_)) | Err(_) => {}
            }
        }
    }
    Json(store.snapshot()).into_response()
}

fn error_response(err: Error, path: &str) -> Response {
    let status = match &err {
        Error::NotLeader { leader: Some(leader) } => {
            let location = format!("http://{}{}", leader, path);
            return (
                StatusCode::TEMPORARY_REDIRECT,
                [(header::LOCATION, location)],
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response();
        }
        Error::NotLeader { leader: None } | Error::NotOpen | Error::Closing => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::NodeNotFound | Error::DatabaseNotFound(_) | Error::RetentionPolicyNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        Error::CannotRemoveLeader
        | Error::NodeExists
        | Error::RetentionPolicyConflict(_)
        | Error::Command(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(path, error = %err, "Meta request failed");
    }
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}
