//! Consensus transport over the cluster TCP port.
//!
//! Each peer connection starts with [`MUX_HEADER_RAFT`] and then carries
//! request/response frames. The client keeps one connection per target and
//! reopens it after any failure.

use std::io;
use std::time::Duration;

use openraft::error::{InstallSnapshotError, RPCError, RaftError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::consensus::{MetaRaft, TypeConfig};
use crate::net::{decode, ClusterConn, MuxListener, MUX_HEADER_RAFT};
use crate::{Error, Result};

const RPC_APPEND_ENTRIES: u8 = 1;
const RPC_VOTE: u8 = 2;
const RPC_INSTALL_SNAPSHOT: u8 = 3;
const RPC_RESPONSE: u8 = 4;

type RpcResult<T, E = RaftError<u64>> = std::result::Result<T, RPCError<u64, BasicNode, E>>;

/// Creates TCP connections to peers named by their `BasicNode` address.
pub struct NetworkFactory {
    timeout: Duration,
}

impl NetworkFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl RaftNetworkFactory<TypeConfig> for NetworkFactory {
    type Network = NetworkConnection;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        NetworkConnection {
            target,
            addr: node.addr.clone(),
            conn: None,
            timeout: self.timeout,
        }
    }
}

pub struct NetworkConnection {
    target: u64,
    addr: String,
    conn: Option<ClusterConn>,
    timeout: Duration,
}

impl NetworkConnection {
    async fn call<Req, Resp>(&mut self, typ: u8, req: &Req, ttl: Duration) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let deadline = Instant::now() + ttl.min(self.timeout);
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => ClusterConn::connect(&self.addr, MUX_HEADER_RAFT, deadline).await?,
        };
        conn.set_deadline(Some(deadline));
        conn.write_frame(typ, req).await?;
        let resp = conn.read_message(RPC_RESPONSE).await?;
        self.conn = Some(conn);
        Ok(resp)
    }

    fn unreachable<E: std::error::Error>(&self, err: Error) -> RPCError<u64, BasicNode, E> {
        debug!(target_node = self.target, addr = %self.addr, error = %err, "Raft RPC failed");
        RPCError::Unreachable(Unreachable::new(&io::Error::new(
            io::ErrorKind::Other,
            format!("{}: {}", self.addr, err),
        )))
    }
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<AppendEntriesResponse<u64>> {
        let resp: std::result::Result<AppendEntriesResponse<u64>, RaftError<u64>> = self
            .call(RPC_APPEND_ENTRIES, &rpc, option.hard_ttl())
            .await
            .map_err(|e| self.unreachable(e))?;
        resp.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        option: RPCOption,
    ) -> RpcResult<VoteResponse<u64>> {
        let resp: std::result::Result<VoteResponse<u64>, RaftError<u64>> = self
            .call(RPC_VOTE, &rpc, option.hard_ttl())
            .await
            .map_err(|e| self.unreachable(e))?;
        resp.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<u64>, RaftError<u64, InstallSnapshotError>> {
        let resp: std::result::Result<
            InstallSnapshotResponse<u64>,
            RaftError<u64, InstallSnapshotError>,
        > = self
            .call(RPC_INSTALL_SNAPSHOT, &rpc, option.hard_ttl())
            .await
            .map_err(|e| self.unreachable(e))?;
        resp.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

/// Serve consensus RPCs arriving on `listener` until `cancel` fires.
pub async fn serve(raft: MetaRaft, mut listener: MuxListener, cancel: CancellationToken) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            stream = listener.accept() => match stream {
                Some(stream) => stream,
                None => break,
            },
        };
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let raft = raft.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut conn = ClusterConn::new(stream, peer);
            if let Err(e) = handle_conn(&raft, &mut conn, &cancel).await {
                debug!(peer = conn.peer(), error = %e, "Raft connection closed");
            }
        });
    }
}

async fn handle_conn(raft: &MetaRaft, conn: &mut ClusterConn, cancel: &CancellationToken) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = conn.try_read_frame() => frame?,
        };
        let Some((typ, payload)) = frame else {
            return Ok(());
        };

        match typ {
            RPC_APPEND_ENTRIES => {
                let req: AppendEntriesRequest<TypeConfig> = decode(&payload)?;
                let resp = raft.append_entries(req).await;
                conn.write_frame(RPC_RESPONSE, &resp).await?;
            }
            RPC_VOTE => {
                let req: VoteRequest<u64> = decode(&payload)?;
                let resp = raft.vote(req).await;
                conn.write_frame(RPC_RESPONSE, &resp).await?;
            }
            RPC_INSTALL_SNAPSHOT => {
                let req: InstallSnapshotRequest<TypeConfig> = decode(&payload)?;
                let resp = raft.install_snapshot(req).await;
                conn.write_frame(RPC_RESPONSE, &resp).await?;
            }
            other => {
                warn!(peer = conn.peer(), typ = other, "Unknown raft RPC type");
                return Err(Error::Serialization(format!("unknown raft RPC type {}", other)));
            }
        }
    }
}
