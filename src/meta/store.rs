//! Consensus-backed metadata store.
//!
//! The store owns the openraft instance for the meta group and the shared
//! `Data` aggregate. Reads are served from a clone of `Data`; every mutation
//! is a [`Command`] committed through the log and applied by the state
//! machine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{BasicNode, Raft, RaftMetrics, SnapshotPolicy};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::MetaClient;
use super::command::{Command, CommandEnvelope, RetentionPolicySpec};
use super::consensus::{MetaRaft, MetaRequest};
use super::data::{Data, NodeInfo, ShardGroupInfo, ShardLocation};
use super::http::JoinRequest;
use super::log_store::LogStore;
use super::network::{self, NetworkFactory};
use super::node::NodeIdentity;
use super::reader::TopologyReader;
use super::state_machine::StateMachine;
use super::TimeRange;
use crate::config::MetaConfig;
use crate::net::MuxListener;
use crate::{Error, Result};

const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RAFT_DIR: &str = "raft";

/// Replicated topology store for one meta node.
pub struct MetaStore {
    config: MetaConfig,
    /// Advertised HTTP address
    http_addr: String,
    /// Advertised cluster TCP address, also the consensus address
    tcp_addr: String,
    raft_id: u64,
    identity: Mutex<NodeIdentity>,
    data: Arc<RwLock<Data>>,
    index_rx: watch::Receiver<u64>,
    index_tx: Mutex<Option<watch::Sender<u64>>>,
    raft: RwLock<Option<MetaRaft>>,
    opening: AtomicBool,
    ready: AtomicBool,
    closing: CancellationToken,
}

impl MetaStore {
    /// Create a store that will advertise `http_addr` and `tcp_addr`.
    /// Nothing is started until [`open`](Self::open).
    pub fn new(
        config: MetaConfig,
        http_addr: impl Into<String>,
        tcp_addr: impl Into<String>,
    ) -> Result<Self> {
        let identity = NodeIdentity::load_or_create(config.dir.as_deref())?;
        let (index_tx, index_rx) = watch::channel(0);
        Ok(Self {
            config,
            http_addr: http_addr.into(),
            tcp_addr: tcp_addr.into(),
            raft_id: identity.raft_id,
            identity: Mutex::new(identity),
            data: Arc::new(RwLock::new(Data::default())),
            index_rx,
            index_tx: Mutex::new(Some(index_tx)),
            raft: RwLock::new(None),
            opening: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            closing: CancellationToken::new(),
        })
    }

    pub fn http_addr(&self) -> &str {
        &self.http_addr
    }

    pub fn tcp_addr(&self) -> &str {
        &self.tcp_addr
    }

    pub fn raft_id(&self) -> u64 {
        self.raft_id
    }

    /// Topology id of this meta node, once registered.
    pub fn node_id(&self) -> Option<u64> {
        self.identity.lock().id
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Start consensus on `listener`, join or bootstrap the group, and wait
    /// for a leader. A sole member then re-asserts its own addresses.
    pub async fn open(&self, listener: MuxListener) -> Result<()> {
        if self
            .opening
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::StoreAlreadyOpen);
        }
        let result = self.open_inner(listener).await;
        if result.is_err() {
            self.opening.store(false, Ordering::Release);
        }
        result
    }

    async fn open_inner(&self, listener: MuxListener) -> Result<()> {
        let raft = self.open_raft(listener).await?;

        if self.config.join_peers.is_empty() {
            let mut members = BTreeMap::new();
            members.insert(self.raft_id, BasicNode::new(self.tcp_addr.as_str()));
            match raft.initialize(members).await {
                Ok(()) => info!(raft_id = self.raft_id, "Bootstrapped meta group"),
                Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                    debug!("Meta group already initialized")
                }
                Err(e) => return Err(Error::Consensus(e.to_string())),
            }
        } else if self.node_id().is_none() {
            let peers = self.config.join_peers.clone();
            self.join_cluster(&peers).await?;
        }

        self.wait_for_leader(self.config.leader_wait_timeout).await?;

        if self.peers().len() <= 1 {
            // The advertised address may differ from what was recorded last run.
            loop {
                match self.set_meta_node(&self.http_addr, &self.tcp_addr).await {
                    Ok(()) => break,
                    Err(e) => {
                        debug!(error = %e, "set meta node failed, retrying");
                        tokio::select! {
                            _ = self.closing.cancelled() => return Err(Error::Closing),
                            _ = tokio::time::sleep(self.config.commit_retry_interval) => {}
                        }
                    }
                }
            }
        }

        let registered = self.data.read().meta_node_by_host(&self.http_addr).cloned();
        if let Some(node) = registered {
            let mut identity = self.identity.lock();
            if identity.id != Some(node.id) {
                identity.id = Some(node.id);
                identity.save()?;
            }
        }

        self.ready.store(true, Ordering::Release);
        if self.config.logging_enabled {
            info!(
                raft_id = self.raft_id,
                node_id = ?self.node_id(),
                http = %self.http_addr,
                tcp = %self.tcp_addr,
                leader = %self.leader(),
                "Meta store open"
            );
        }
        Ok(())
    }

    async fn open_raft(&self, listener: MuxListener) -> Result<MetaRaft> {
        let raft_dir = self.config.dir.as_ref().map(|d| d.join(RAFT_DIR));
        let log_store = match &raft_dir {
            Some(dir) => LogStore::open(dir)?,
            None => LogStore::in_memory(),
        };
        let index_tx = self.index_tx.lock().take().ok_or(Error::StoreAlreadyOpen)?;
        let state_machine = StateMachine::open(self.data.clone(), index_tx, raft_dir.as_deref())?;

        let heartbeat = self.config.heartbeat_interval.as_millis() as u64;
        let election = self.config.election_timeout.as_millis() as u64;
        let raft_config = openraft::Config {
            cluster_name: "tidemark-meta".to_string(),
            heartbeat_interval: heartbeat,
            election_timeout_min: election,
            election_timeout_max: election * 2,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(1000),
            ..Default::default()
        }
        .validate()
        .map_err(|e| Error::Config(format!("raft config: {}", e)))?;

        let raft = Raft::new(
            self.raft_id,
            Arc::new(raft_config),
            NetworkFactory::new(self.config.apply_timeout),
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| Error::Consensus(e.to_string()))?;

        *self.raft.write() = Some(raft.clone());
        tokio::spawn(network::serve(raft.clone(), listener, self.closing.child_token()));
        Ok(raft)
    }

    /// Stop consensus and release waiters. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closing.is_cancelled() {
            return Ok(());
        }
        self.closing.cancel();
        self.ready.store(false, Ordering::Release);
        let raft = self.raft.write().take();
        if let Some(raft) = raft {
            if let Err(e) = raft.shutdown().await {
                warn!(error = %e, "Raft shutdown reported an error");
            }
        }
        info!(raft_id = self.raft_id, "Meta store closed");
        Ok(())
    }

    fn raft(&self) -> Result<MetaRaft> {
        self.raft.read().clone().ok_or(Error::NotOpen)
    }

    fn metrics(&self) -> Option<RaftMetrics<u64, BasicNode>> {
        self.raft
            .read()
            .as_ref()
            .map(|raft| raft.metrics().borrow().clone())
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    /// Submit an encoded command. Returns the topology index after apply.
    pub async fn apply(&self, command: Vec<u8>) -> Result<u64> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(Error::NotOpen);
        }
        self.propose(command).await
    }

    /// Wrap `command` in an envelope and [`apply`](Self::apply) it.
    pub async fn execute(&self, command: Command) -> Result<u64> {
        self.apply(CommandEnvelope::new(command).encode()?).await
    }

    async fn execute_unchecked(&self, command: Command) -> Result<u64> {
        self.propose(CommandEnvelope::new(command).encode()?).await
    }

    async fn propose(&self, command: Vec<u8>) -> Result<u64> {
        let raft = self.raft()?;
        let write = raft.client_write(MetaRequest { command });
        let resp = match tokio::time::timeout(self.config.apply_timeout, write).await {
            Ok(resp) => resp,
            Err(_) => {
                return Err(Error::Consensus(format!(
                    "apply not committed within {:?}",
                    self.config.apply_timeout
                )))
            }
        };

        match resp {
            Ok(resp) => match resp.data.error {
                Some(msg) => Err(Error::Command(msg)),
                None => Ok(resp.data.index),
            },
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(fwd))) => {
                let leader = fwd
                    .leader_node
                    .and_then(|node| self.http_for_tcp(&node.addr));
                Err(Error::NotLeader { leader })
            }
            Err(e) => Err(Error::Consensus(e.to_string())),
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Deep copy of the current topology.
    pub fn snapshot(&self) -> Data {
        self.data.read().clone()
    }

    pub fn index(&self) -> u64 {
        self.data.read().index
    }

    /// Handle that completes once the index moves past `index`.
    pub fn after_index(&self, index: u64) -> IndexWait {
        IndexWait {
            rx: self.index_rx.clone(),
            index,
            closing: self.closing.clone(),
        }
    }

    /// Confirm leadership with a quorum before a linearizable read.
    pub async fn ensure_linearizable(&self) -> Result<()> {
        let raft = self.raft()?;
        match raft.ensure_linearizable().await {
            Ok(_) => Ok(()),
            Err(RaftError::APIError(openraft::error::CheckIsLeaderError::ForwardToLeader(fwd))) => {
                let leader = fwd
                    .leader_node
                    .and_then(|node| self.http_for_tcp(&node.addr));
                Err(Error::NotLeader { leader })
            }
            Err(e) => Err(Error::Consensus(e.to_string())),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.metrics()
            .map_or(false, |m| m.current_leader == Some(self.raft_id))
    }

    /// Consensus address of the leader, or empty when unknown.
    pub fn leader(&self) -> String {
        let Some(m) = self.metrics() else {
            return String::new();
        };
        m.current_leader
            .and_then(|id| {
                m.membership_config
                    .membership()
                    .get_node(&id)
                    .map(|node| node.addr.clone())
            })
            .unwrap_or_default()
    }

    /// HTTP address of the leader, or empty when unknown.
    pub fn leader_http(&self) -> String {
        let leader = self.leader();
        if leader.is_empty() {
            return leader;
        }
        self.http_for_tcp(&leader).unwrap_or_default()
    }

    fn http_for_tcp(&self, tcp_host: &str) -> Option<String> {
        self.data
            .read()
            .meta_node_by_tcp_host(tcp_host)
            .map(|n| n.host.clone())
    }

    /// Poll until a leader is known. A zero timeout waits forever.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.closing.is_cancelled() {
                return Err(Error::Closing);
            }
            if !self.leader().is_empty() {
                return Ok(());
            }
            if !timeout.is_zero() && start.elapsed() >= timeout {
                return Err(Error::Timeout);
            }
            tokio::select! {
                _ = self.closing.cancelled() => return Err(Error::Closing),
                _ = tokio::time::sleep(LEADER_POLL_INTERVAL) => {}
            }
        }
    }

    /// Consensus addresses of the current voters.
    pub fn peers(&self) -> Vec<String> {
        let Some(m) = self.metrics() else {
            return Vec::new();
        };
        let membership = m.membership_config.membership();
        membership
            .voter_ids()
            .filter_map(|id| membership.get_node(&id).map(|n| n.addr.clone()))
            .collect()
    }

    pub fn meta_servers_http(&self) -> Vec<String> {
        self.data.read().meta_nodes.iter().map(|n| n.host.clone()).collect()
    }

    pub fn other_meta_servers_http(&self) -> Vec<String> {
        self.data
            .read()
            .meta_nodes
            .iter()
            .filter(|n| n.tcp_host != self.tcp_addr)
            .map(|n| n.host.clone())
            .collect()
    }

    /// Cluster TCP addresses of all data nodes.
    pub fn data_servers(&self) -> Vec<String> {
        self.data.read().data_nodes.iter().map(|n| n.tcp_host.clone()).collect()
    }

    pub fn meta_node_by_addr(&self, host: &str) -> Result<NodeInfo> {
        self.data
            .read()
            .meta_node_by_host(host)
            .cloned()
            .ok_or(Error::NodeNotFound)
    }

    // ---------------------------------------------------------------------
    // Membership
    // ---------------------------------------------------------------------

    /// Add a meta node as a voter and register it in the topology.
    pub async fn join_meta(&self, req: &JoinRequest) -> Result<NodeInfo> {
        let raft = self.raft()?;
        if !self.is_leader() {
            let leader = self.leader_http();
            return Err(Error::NotLeader {
                leader: (!leader.is_empty()).then_some(leader),
            });
        }

        raft.add_learner(req.raft_id, BasicNode::new(req.tcp_host.as_str()), true)
            .await
            .map_err(|e| Error::Consensus(format!("add learner {}: {}", req.tcp_host, e)))?;
        let mut voters = self.voter_ids();
        voters.insert(req.raft_id);
        raft.change_membership(voters, false)
            .await
            .map_err(|e| Error::Consensus(format!("add voter {}: {}", req.tcp_host, e)))?;
        if self.config.logging_enabled {
            info!(raft_id = req.raft_id, tcp = %req.tcp_host, "Added meta voter");
        }

        self.create_meta_node(&req.host, &req.tcp_host).await?;

        self.data
            .read()
            .meta_nodes
            .iter()
            .find(|n| n.host == req.host && n.tcp_host == req.tcp_host)
            .cloned()
            .ok_or(Error::NodeNotFound)
    }

    /// Remove a meta node from the group and the topology. The leader
    /// cannot be removed.
    pub async fn remove_meta(&self, host: &str) -> Result<NodeInfo> {
        let node = self.meta_node_by_addr(host)?;
        if self.leader_http() == host {
            return Err(Error::CannotRemoveLeader);
        }

        self.remove_voter(&node.tcp_host).await?;
        self.delete_meta_node(node.id).await?;

        let still_present = self
            .data
            .read()
            .meta_nodes
            .iter()
            .any(|n| n.host == node.host && n.tcp_host == node.tcp_host);
        if still_present {
            return Err(Error::UnableToDropNode);
        }
        info!(node_id = node.id, host = %node.host, "Removed meta node");
        Ok(node)
    }

    /// Register this node with an existing group through a peer's HTTP API.
    pub async fn join_cluster(&self, peers: &[String]) -> Result<NodeInfo> {
        if peers.is_empty() {
            return Err(Error::EmptyPeers);
        }
        let client = MetaClient::new(peers.to_vec(), self.config.apply_timeout)?;
        let node = client
            .join(&JoinRequest {
                host: self.http_addr.clone(),
                tcp_host: self.tcp_addr.clone(),
                raft_id: self.raft_id,
            })
            .await?;

        let mut identity = self.identity.lock();
        identity.id = Some(node.id);
        identity.save()?;
        info!(node_id = node.id, "Joined meta group");
        Ok(node)
    }

    /// Drop `node` from the voter set without touching the topology.
    pub async fn leave(&self, node: &NodeInfo) -> Result<()> {
        self.remove_voter(&node.tcp_host).await
    }

    fn voter_ids(&self) -> BTreeSet<u64> {
        self.metrics()
            .map(|m| m.membership_config.membership().voter_ids().collect())
            .unwrap_or_default()
    }

    async fn remove_voter(&self, tcp_host: &str) -> Result<()> {
        let raft = self.raft()?;
        let Some(m) = self.metrics() else {
            return Err(Error::NotOpen);
        };
        let membership = m.membership_config.membership();
        let target = membership
            .nodes()
            .find(|(_, node)| node.addr == tcp_host)
            .map(|(id, _)| *id);
        let Some(target) = target else {
            debug!(tcp = %tcp_host, "Not a consensus member, nothing to remove");
            return Ok(());
        };

        let voters: BTreeSet<u64> = membership.voter_ids().filter(|id| *id != target).collect();
        raft.change_membership(voters, false)
            .await
            .map_err(|e| Error::Consensus(format!("remove voter {}: {}", tcp_host, e)))?;
        if self.config.logging_enabled {
            info!(raft_id = target, tcp = %tcp_host, "Removed meta voter");
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Command helpers
    // ---------------------------------------------------------------------

    pub async fn create_meta_node(&self, host: &str, tcp_host: &str) -> Result<()> {
        self.execute(Command::CreateMetaNode {
            host: host.to_string(),
            tcp_host: tcp_host.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Create or re-address the sole meta node.
    pub async fn set_meta_node(&self, host: &str, tcp_host: &str) -> Result<()> {
        self.execute_unchecked(Command::SetMetaNode {
            host: host.to_string(),
            tcp_host: tcp_host.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn delete_meta_node(&self, id: u64) -> Result<()> {
        self.execute(Command::DeleteMetaNode { id }).await.map(|_| ())
    }

    /// Register a data node, returning the existing record if its TCP
    /// address is already known.
    pub async fn create_data_node(&self, host: &str, tcp_host: &str) -> Result<NodeInfo> {
        if let Some(node) = self.data.read().data_node_by_tcp_host(tcp_host).cloned() {
            return Ok(node);
        }
        self.execute(Command::CreateDataNode {
            host: host.to_string(),
            tcp_host: tcp_host.to_string(),
        })
        .await?;
        self.data
            .read()
            .data_node_by_tcp_host(tcp_host)
            .cloned()
            .ok_or(Error::NodeNotFound)
    }

    pub async fn create_database(
        &self,
        name: &str,
        retention_policy: Option<RetentionPolicySpec>,
    ) -> Result<()> {
        self.execute(Command::CreateDatabase {
            name: name.to_string(),
            retention_policy,
        })
        .await
        .map(|_| ())
    }

    pub async fn create_retention_policy(
        &self,
        database: &str,
        policy: RetentionPolicySpec,
        make_default: bool,
    ) -> Result<()> {
        self.execute(Command::CreateRetentionPolicy {
            database: database.to_string(),
            policy,
            make_default,
        })
        .await
        .map(|_| ())
    }

    /// Ensure a shard group covers `timestamp` and return it.
    pub async fn create_shard_group(
        &self,
        database: &str,
        policy: &str,
        timestamp: i64,
    ) -> Result<ShardGroupInfo> {
        let existing = self
            .data
            .read()
            .retention_policy(database, policy)?
            .shard_group_by_timestamp(timestamp)
            .cloned();
        if let Some(sg) = existing {
            return Ok(sg);
        }

        self.execute(Command::CreateShardGroup {
            database: database.to_string(),
            policy: policy.to_string(),
            timestamp,
        })
        .await?;
        self.data
            .read()
            .retention_policy(database, policy)?
            .shard_group_by_timestamp(timestamp)
            .cloned()
            .ok_or_else(|| Error::Internal("shard group missing after create".to_string()))
    }

    /// Mark a shard group deleted as of now.
    pub async fn delete_shard_group(&self, database: &str, policy: &str, id: u64) -> Result<()> {
        let deleted_at = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        self.execute(Command::DeleteShardGroup {
            database: database.to_string(),
            policy: policy.to_string(),
            id,
            deleted_at,
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl TopologyReader for MetaStore {
    async fn shard_groups_by_time_range(
        &self,
        database: &str,
        retention_policy: &str,
        range: TimeRange,
    ) -> Result<Vec<ShardGroupInfo>> {
        self.data
            .read()
            .shard_groups_by_time_range(database, retention_policy, range)
    }

    async fn data_node(&self, id: u64) -> Result<NodeInfo> {
        self.data.read().data_node(id).cloned().ok_or(Error::NodeNotFound)
    }

    async fn shard_location(&self, shard_id: u64) -> Result<Option<ShardLocation>> {
        Ok(self.data.read().shard_location(shard_id))
    }
}

/// Completion handle returned by [`MetaStore::after_index`].
pub struct IndexWait {
    rx: watch::Receiver<u64>,
    index: u64,
    closing: CancellationToken,
}

impl IndexWait {
    /// True once the applied index is past the awaited index.
    pub fn is_complete(&self) -> bool {
        *self.rx.borrow() > self.index
    }

    /// Wait for completion; fails with `Error::Closing` if the store shuts down.
    pub async fn wait(mut self) -> Result<u64> {
        let target = self.index;
        tokio::select! {
            _ = self.closing.cancelled() => Err(Error::Closing),
            changed = self.rx.wait_for(|index| *index > target) => {
                changed.map(|index| *index).map_err(|_| Error::Closing)
            }
        }
    }
}
