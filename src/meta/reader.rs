//! Read-only view of the topology used by routing components.

use async_trait::async_trait;

use super::data::{NodeInfo, ShardGroupInfo, ShardLocation};
use super::TimeRange;
use crate::Result;

/// Topology lookups needed by the shard mapper, dialer and shard writer.
///
/// Implemented by [`MetaStore`](super::MetaStore); tests substitute their
/// own implementations.
#[async_trait]
pub trait TopologyReader: Send + Sync {
    /// Live shard groups of `database`/`retention_policy` overlapping `range`.
    /// An empty policy name selects the database default.
    async fn shard_groups_by_time_range(
        &self,
        database: &str,
        retention_policy: &str,
        range: TimeRange,
    ) -> Result<Vec<ShardGroupInfo>>;

    /// Data node by id; `Error::NodeNotFound` if unknown.
    async fn data_node(&self, id: u64) -> Result<NodeInfo>;

    /// Database, policy and owners of a shard.
    async fn shard_location(&self, _shard_id: u64) -> Result<Option<ShardLocation>> {
        Ok(None)
    }
}
