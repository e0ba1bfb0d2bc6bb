//! Shared fixtures for Tidemark integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tidemark::config::MetaConfig;
use tidemark::coordinator::{ClusterService, ShardStore};
use tidemark::meta::{
    MetaStore, NodeInfo, ShardGroupInfo, ShardInfo, ShardLocation, ShardOwner, TimeRange,
    TopologyReader,
};
use tidemark::net::{Mux, MUX_HEADER_CLUSTER, MUX_HEADER_RAFT};
use tidemark::query::{FieldValue, Point};
use tidemark::{Error, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const SECOND: i64 = 1_000_000_000;

pub fn cpu(host: &str, time: i64, value: f64) -> Point {
    Point::new("cpu", time)
        .tag("host", host)
        .field("value", FieldValue::Float(value))
}

// ============================================================================
// Static topology
// ============================================================================

/// In-memory `TopologyReader` that counts shard group lookups.
#[derive(Default)]
pub struct StaticTopology {
    groups: RwLock<HashMap<(String, String), Vec<ShardGroupInfo>>>,
    nodes: RwLock<HashMap<u64, NodeInfo>>,
    lookups: AtomicUsize,
}

impl StaticTopology {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_node(&self, id: u64, tcp_host: &str) {
        self.nodes.write().insert(
            id,
            NodeInfo {
                id,
                host: format!("http-{}", id),
                tcp_host: tcp_host.to_string(),
                is_meta: false,
            },
        );
    }

    pub fn add_group(&self, database: &str, policy: &str, group: ShardGroupInfo) {
        self.groups
            .write()
            .entry((database.to_string(), policy.to_string()))
            .or_default()
            .push(group);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TopologyReader for StaticTopology {
    async fn shard_groups_by_time_range(
        &self,
        database: &str,
        retention_policy: &str,
        range: TimeRange,
    ) -> Result<Vec<ShardGroupInfo>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let groups = self.groups.read();
        Ok(groups
            .get(&(database.to_string(), retention_policy.to_string()))
            .map(|gs| {
                gs.iter()
                    .filter(|sg| !sg.deleted() && sg.overlaps(range))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn data_node(&self, id: u64) -> Result<NodeInfo> {
        self.nodes.read().get(&id).cloned().ok_or(Error::NodeNotFound)
    }

    async fn shard_location(&self, shard_id: u64) -> Result<Option<ShardLocation>> {
        let groups = self.groups.read();
        for ((database, policy), gs) in groups.iter() {
            for sg in gs {
                if let Some(shard) = sg.shards.iter().find(|s| s.id == shard_id) {
                    return Ok(Some(ShardLocation {
                        database: database.clone(),
                        retention_policy: policy.clone(),
                        shard_group_id: sg.id,
                        shard: shard.clone(),
                    }));
                }
            }
        }
        Ok(None)
    }
}

/// A shard group over `[start, end)` whose shards are `(id, owners)`.
pub fn shard_group(id: u64, start: i64, end: i64, shards: Vec<(u64, Vec<u64>)>) -> ShardGroupInfo {
    ShardGroupInfo {
        id,
        start_time: start,
        end_time: end,
        deleted_at: None,
        shards: shards
            .into_iter()
            .map(|(shard_id, owners)| ShardInfo {
                id: shard_id,
                owners: owners.into_iter().map(|node_id| ShardOwner { node_id }).collect(),
            })
            .collect(),
    }
}

// ============================================================================
// Servers
// ============================================================================

/// Serve cluster RPC for `store` on an ephemeral port. Returns the address.
pub async fn start_cluster_service(
    store: Arc<dyn ShardStore>,
    topology: Arc<dyn TopologyReader>,
    cancel: &CancellationToken,
) -> String {
    start_cluster_service_at("127.0.0.1:0", store, topology, cancel).await
}

/// Serve cluster RPC on `addr`, retrying the bind while a previous listener
/// on the same port shuts down.
pub async fn start_cluster_service_at(
    addr: &str,
    store: Arc<dyn ShardStore>,
    topology: Arc<dyn TopologyReader>,
    cancel: &CancellationToken,
) -> String {
    let mut attempts = 0;
    let listener = loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => break listener,
            Err(_) if attempts < 100 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("bind {addr}: {e}"),
        }
    };
    let mut mux = Mux::new(listener).unwrap();
    let rpc = mux.listen(MUX_HEADER_CLUSTER).unwrap();
    let addr = mux.local_addr().to_string();
    tokio::spawn(mux.serve(cancel.child_token()));

    let service = Arc::new(ClusterService::new(store, topology));
    tokio::spawn(service.serve(rpc, cancel.child_token()));
    addr
}

pub fn fast_meta_config(dir: Option<&Path>) -> MetaConfig {
    MetaConfig {
        dir: dir.map(Path::to_path_buf),
        heartbeat_interval: Duration::from_millis(50),
        election_timeout: Duration::from_millis(200),
        apply_timeout: Duration::from_secs(5),
        leader_wait_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

/// A running single meta node with its HTTP API.
pub struct MetaNode {
    pub store: Arc<MetaStore>,
    pub http_addr: String,
    pub tcp_addr: String,
    pub cancel: CancellationToken,
}

impl MetaNode {
    pub async fn close(&self) {
        self.store.close().await.unwrap();
        self.cancel.cancel();
    }
}

/// Start a meta store on ephemeral ports and wait for it to open.
pub async fn start_meta_node(config: MetaConfig) -> MetaNode {
    let cancel = CancellationToken::new();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut mux = Mux::new(listener).unwrap();
    let raft = mux.listen(MUX_HEADER_RAFT).unwrap();
    let tcp_addr = mux.local_addr().to_string();
    tokio::spawn(mux.serve(cancel.child_token()));

    let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http.local_addr().unwrap().to_string();

    let store = Arc::new(MetaStore::new(config, http_addr.clone(), tcp_addr.clone()).unwrap());
    let router = tidemark::meta::router(store.clone());
    let http_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = axum::serve(http, router)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await;
    });

    store.open(raft).await.unwrap();
    MetaNode {
        store,
        http_addr,
        tcp_addr,
        cancel,
    }
}
