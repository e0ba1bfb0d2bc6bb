//! Forward point batches to the node that owns a shard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info};

use super::messages::{
    WriteShardRequest, WriteShardResponse, WRITE_OK, WRITE_SHARD_REQUEST, WRITE_SHARD_RESPONSE,
};
use crate::config::CoordinatorConfig;
use crate::meta::TopologyReader;
use crate::net::{decode, ClusterConn, MUX_HEADER_CLUSTER};
use crate::query::Point;
use crate::{Error, Result};

/// Connections to one destination. `permits` bounds how many are checked
/// out at once; idle connections are reused.
struct NodePool {
    addr: String,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<ClusterConn>>,
}

impl NodePool {
    fn new(addr: String, max_connections: usize) -> Self {
        Self {
            addr,
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            idle: Mutex::new(Vec::new()),
        }
    }
}

/// Writes points to remote shard owners over pooled cluster connections.
pub struct ShardWriter {
    topology: Arc<dyn TopologyReader>,
    timeout: Duration,
    max_connections: usize,
    pool_wait: Duration,
    pools: DashMap<u64, Arc<NodePool>>,
    closed: AtomicBool,
}

impl ShardWriter {
    pub fn new(topology: Arc<dyn TopologyReader>, config: &CoordinatorConfig) -> Self {
        Self {
            topology,
            timeout: config.shard_writer_timeout,
            max_connections: config.max_remote_write_connections,
            pool_wait: config.pool_wait_timeout,
            pools: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Send `points` for `shard_id` to `owner_id` and wait for its
    /// acknowledgement, all within the writer timeout.
    pub async fn write_shard(&self, shard_id: u64, owner_id: u64, points: Vec<Point>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closing);
        }
        let start = std::time::Instant::now();
        let deadline = Instant::now() + self.timeout;

        let result = self.write_inner(shard_id, owner_id, points, deadline).await;

        let outcome = match &result {
            Ok(()) => "ok",
            Err(e) if e.is_timeout() => "timeout",
            Err(Error::PoolExhausted) => "pool_exhausted",
            Err(Error::RemoteWrite { .. }) => "rejected",
            Err(_) => "error",
        };
        counter!("tidemark_shard_writer_writes_total", "outcome" => outcome).increment(1);
        histogram!("tidemark_shard_writer_duration_seconds").record(start.elapsed().as_secs_f64());
        result
    }

    async fn write_inner(
        &self,
        shard_id: u64,
        owner_id: u64,
        points: Vec<Point>,
        deadline: Instant,
    ) -> Result<()> {
        let node = self.topology.data_node(owner_id).await?;
        let pool = self.pool(owner_id, &node.tcp_host);
        let _permit = self.acquire(&pool).await?;

        let request = WriteShardRequest { shard_id, points };
        let resp = match self.checkout_idle(&pool) {
            Some(mut conn) => match exchange(&mut conn, &request, deadline).await {
                Exchange::Done(resp) => self.checkin(&pool, conn, resp),
                Exchange::Stale(e) => {
                    // The owner dropped the pooled connection before answering.
                    debug!(owner_id, error = %e, "Pooled connection is stale, redialing");
                    counter!("tidemark_shard_writer_redials_total").increment(1);
                    self.dial_and_exchange(&pool, &request, deadline).await?
                }
                Exchange::Failed(e) => return Err(e),
            },
            None => self.dial_and_exchange(&pool, &request, deadline).await?,
        };

        if resp.code != WRITE_OK {
            return Err(Error::RemoteWrite {
                code: resp.code,
                message: resp.message,
            });
        }
        debug!(shard_id, owner_id, "Forwarded shard write");
        Ok(())
    }

    async fn dial_and_exchange(
        &self,
        pool: &NodePool,
        request: &WriteShardRequest,
        deadline: Instant,
    ) -> Result<WriteShardResponse> {
        let mut conn = ClusterConn::connect(&pool.addr, MUX_HEADER_CLUSTER, deadline).await?;
        match exchange(&mut conn, request, deadline).await {
            Exchange::Done(resp) => Ok(self.checkin(pool, conn, resp)),
            Exchange::Stale(e) | Exchange::Failed(e) => Err(e),
        }
    }

    /// Pop an idle connection, discarding any the peer already closed.
    fn checkout_idle(&self, pool: &NodePool) -> Option<ClusterConn> {
        let mut idle = pool.idle.lock();
        while let Some(conn) = idle.pop() {
            if !conn.is_closed() {
                return Some(conn);
            }
            debug!(addr = %pool.addr, "Dropping closed pooled connection");
        }
        None
    }

    /// Only a connection that completed a full exchange goes back.
    fn checkin(&self, pool: &NodePool, mut conn: ClusterConn, resp: WriteShardResponse) -> WriteShardResponse {
        conn.set_deadline(None);
        if !self.closed.load(Ordering::Acquire) {
            pool.idle.lock().push(conn);
        }
        resp
    }

    fn pool(&self, node_id: u64, addr: &str) -> Arc<NodePool> {
        let mut entry = self
            .pools
            .entry(node_id)
            .or_insert_with(|| Arc::new(NodePool::new(addr.to_string(), self.max_connections)));
        if entry.addr != addr {
            info!(node_id, old = %entry.addr, new = %addr, "Data node address changed, resetting pool");
            *entry = Arc::new(NodePool::new(addr.to_string(), self.max_connections));
        }
        entry.value().clone()
    }

    async fn acquire(&self, pool: &NodePool) -> Result<OwnedSemaphorePermit> {
        let permits = pool.permits.clone();
        if self.pool_wait.is_zero() {
            return permits.try_acquire_owned().map_err(|_| {
                counter!("tidemark_shard_writer_pool_exhausted_total").increment(1);
                Error::PoolExhausted
            });
        }
        match tokio::time::timeout(self.pool_wait, permits.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::Closing),
            Err(_) => {
                counter!("tidemark_shard_writer_pool_exhausted_total").increment(1);
                Err(Error::PoolExhausted)
            }
        }
    }

    /// Close every idle connection. In-flight writes finish but their
    /// connections are not returned to the pool.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let pools: Vec<Arc<NodePool>> = self.pools.iter().map(|e| e.value().clone()).collect();
        self.pools.clear();
        for pool in pools {
            pool.permits.close();
            let conns: Vec<ClusterConn> = std::mem::take(&mut *pool.idle.lock());
            for mut conn in conns {
                conn.shutdown().await;
            }
        }
    }
}

enum Exchange {
    Done(WriteShardResponse),
    /// Failed before any response byte arrived; the request was not acted on
    /// by a live handler and may be resent on a fresh connection.
    Stale(Error),
    Failed(Error),
}

async fn exchange(conn: &mut ClusterConn, request: &WriteShardRequest, deadline: Instant) -> Exchange {
    conn.set_deadline(Some(deadline));
    if let Err(e) = conn.write_frame(WRITE_SHARD_REQUEST, request).await {
        return match e {
            Error::Io(_) => Exchange::Stale(e),
            e => Exchange::Failed(e),
        };
    }
    let frame = match conn.try_read_frame().await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            return Exchange::Stale(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before response",
            )))
        }
        Err(Error::Io(e)) if is_reset(&e) => return Exchange::Stale(Error::Io(e)),
        Err(e) => return Exchange::Failed(e),
    };
    match decode_response(frame) {
        Ok(resp) => Exchange::Done(resp),
        Err(e) => Exchange::Failed(e),
    }
}

fn decode_response((typ, payload): (u8, Vec<u8>)) -> Result<WriteShardResponse> {
    if typ != WRITE_SHARD_RESPONSE {
        return Err(Error::Serialization(format!(
            "unexpected message type {} (want {})",
            typ, WRITE_SHARD_RESPONSE
        )));
    }
    decode(&payload)
}

fn is_reset(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
    )
}
