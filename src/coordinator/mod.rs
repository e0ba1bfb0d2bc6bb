//! Query and write coordination across data nodes.
//!
//! - [`ShardMapper`] resolves query sources into local and remote shards
//!   and hands back a [`ShardMapping`] that merges their iterators.
//! - [`RemoteIteratorCreator`] speaks the cluster RPC protocol to a peer.
//! - [`ShardWriter`] forwards point batches to a shard owner over pooled
//!   connections.
//! - [`ClusterService`] is the server side of both protocols.

mod dialer;
mod mapper;
pub mod messages;
mod remote;
mod service;
mod writer;

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::query::{BoxIterator, DataType, FieldDimensions, IteratorCost, IteratorOptions, Measurement, Point};
use crate::Result;

pub use dialer::NodeDialer;
pub use mapper::{ShardMapper, ShardMapping};
pub use remote::{RemoteIterator, RemoteIteratorCreator};
pub use service::ClusterService;
pub use writer::ShardWriter;

/// Routing key for per-query shard resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Source {
    pub database: String,
    pub retention_policy: String,
}

impl Source {
    pub fn new(database: impl Into<String>, retention_policy: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            retention_policy: retention_policy.into(),
        }
    }
}

impl From<&Measurement> for Source {
    fn from(m: &Measurement) -> Self {
        Self::new(m.database.clone(), m.retention_policy.clone())
    }
}

/// A set of local shards treated as one unit by the query layer.
#[async_trait]
pub trait ShardGroup: Send + Sync {
    /// Measurement names in these shards matching `re`, sorted.
    fn measurements_by_regex(&self, re: &Regex) -> Vec<String>;

    fn field_dimensions(&self, measurements: &[String]) -> Result<FieldDimensions>;

    /// Type of `field` in `measurement`; `Tag` for a tag key, `Unknown` if absent.
    fn map_type(&self, measurement: &str, field: &str) -> DataType;

    fn iterator_cost(&self, measurement: &str, opt: &IteratorOptions) -> Result<IteratorCost>;

    /// Iterator over one concrete measurement. `measurement.regex` is ignored.
    async fn create_iterator(
        &self,
        cancel: &CancellationToken,
        measurement: &Measurement,
        opt: &IteratorOptions,
    ) -> Result<BoxIterator>;
}

/// Builds shard group handles over local shards.
pub trait ShardGroupProvider: Send + Sync {
    fn shard_group(&self, ids: &[u64]) -> Arc<dyn ShardGroup>;
}

/// Local storage engine as seen by the coordinator.
#[async_trait]
pub trait ShardStore: ShardGroupProvider {
    /// The subset of `ids` this store holds.
    fn shards(&self, ids: &[u64]) -> Vec<u64>;

    /// Ensure a shard exists. Creating an existing shard is not an error.
    async fn create_shard(
        &self,
        database: &str,
        retention_policy: &str,
        shard_id: u64,
        enabled: bool,
    ) -> Result<()>;

    /// Write points to a local shard; `Error::ShardNotFound` if it is unknown.
    async fn write_to_shard(&self, shard_id: u64, points: &[Point]) -> Result<()>;
}
