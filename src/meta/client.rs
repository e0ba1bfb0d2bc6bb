//! HTTP client for the meta API.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::command::Command;
use super::data::{Data, NodeInfo};
use super::http::{ExecuteResponse, JoinRequest, RemoveRequest, StatusResponse};
use crate::{Error, Result};

/// Talks to a set of meta nodes by HTTP address. Requests go to the first
/// peer that answers; redirects from followers are followed to the leader.
#[derive(Debug, Clone)]
pub struct MetaClient {
    peers: Vec<String>,
    http: reqwest::Client,
}

impl MetaClient {
    pub fn new(peers: Vec<String>, timeout: Duration) -> Result<Self> {
        if peers.is_empty() {
            return Err(Error::EmptyPeers);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(1))
            .build()?;
        Ok(Self { peers, http })
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Register a meta node with the group.
    pub async fn join(&self, request: &JoinRequest) -> Result<NodeInfo> {
        self.post_any("/join", request).await
    }

    /// Remove the meta node serving HTTP at `host`.
    pub async fn remove(&self, host: &str) -> Result<NodeInfo> {
        self.post_any(
            "/remove",
            &RemoveRequest {
                host: host.to_string(),
            },
        )
        .await
    }

    /// Apply a command on the leader and return the resulting index.
    pub async fn execute(&self, command: &Command) -> Result<u64> {
        let resp: ExecuteResponse = self.post_any("/execute", command).await?;
        Ok(resp.index)
    }

    pub async fn status(&self) -> Result<StatusResponse> {
        self.get_any("/status").await
    }

    /// Fetch the topology once its index is past `index`.
    pub async fn data(&self, index: u64) -> Result<Data> {
        self.get_any(&format!("/data?index={}", index)).await
    }

    async fn post_any<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut last_err = Error::EmptyPeers;
        for peer in &self.peers {
            let url = format!("http://{}{}", peer, path);
            let result = match self.http.post(&url).json(body).send().await {
                Ok(resp) => decode_response(resp).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    debug!(peer = %peer, path, error = %e, "Meta request failed, trying next peer");
                    last_err = e;
                }
            }
        }
        warn!(path, error = %last_err, "No meta peer accepted the request");
        Err(last_err)
    }

    async fn get_any<Resp: DeserializeOwned>(&self, path: &str) -> Result<Resp> {
        let mut last_err = Error::EmptyPeers;
        for peer in &self.peers {
            let url = format!("http://{}{}", peer, path);
            let result = match self.http.get(&url).send().await {
                Ok(resp) => decode_response(resp).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(resp) => return Ok(resp),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

async fn decode_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    let message = body
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap_or("no error message")
        .to_string();
    Err(Error::Remote(format!("{}: {}", status, message)))
}
