use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::meta::TopologyReader;
use crate::net::{ClusterConn, MUX_HEADER_CLUSTER};
use crate::Result;

/// Opens cluster RPC connections to data nodes by id.
#[derive(Clone)]
pub struct NodeDialer {
    topology: Arc<dyn TopologyReader>,
    timeout: Duration,
}

impl NodeDialer {
    pub fn new(topology: Arc<dyn TopologyReader>, timeout: Duration) -> Self {
        Self { topology, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve `node_id`, connect and write the cluster mux byte. The
    /// returned connection carries a deadline `timeout` from now.
    pub async fn dial(&self, node_id: u64) -> Result<ClusterConn> {
        let node = self.topology.data_node(node_id).await?;
        let deadline = Instant::now() + self.timeout;
        debug!(node_id, addr = %node.tcp_host, "Dialing data node");
        ClusterConn::connect(&node.tcp_host, MUX_HEADER_CLUSTER, deadline).await
    }
}
