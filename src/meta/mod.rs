//! Cluster topology: nodes, databases, retention policies, shard groups and
//! shards, replicated across meta nodes through consensus.

mod client;
mod command;
mod consensus;
mod data;
mod http;
mod log_store;
mod network;
mod node;
mod reader;
mod state_machine;
mod store;

use std::ops::Range;

use serde::{Deserialize, Serialize};

pub use client::MetaClient;
pub use command::{Command, CommandEnvelope, RetentionPolicySpec};
pub use consensus::{MetaRaft, MetaRequest, MetaResponse, TypeConfig};
pub use data::{
    shard_group_duration_for, Data, DatabaseInfo, NodeInfo, RetentionPolicyInfo, ShardGroupInfo,
    ShardInfo, ShardLocation, ShardOwner, DEFAULT_RETENTION_POLICY_NAME,
};
pub use http::{router, ExecuteResponse, JoinRequest, RemoveRequest, StatusResponse};
pub use log_store::LogStore;
pub use node::NodeIdentity;
pub use reader::TopologyReader;
pub use state_machine::StateMachine;
pub use store::{IndexWait, MetaStore};

/// Inclusive time range in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}

impl From<Range<i64>> for TimeRange {
    fn from(range: Range<i64>) -> Self {
        Self::new(range.start, range.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_range_bounds_are_inclusive() {
        let range = TimeRange::new(10, 20);
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(21));
        assert!(range.overlaps(&TimeRange::new(20, 30)));
        assert!(!range.overlaps(&TimeRange::new(21, 30)));
    }
}
