//! # Tidemark
//!
//! Coordination core of a clustered time-series database.
//!
//! ## Components
//!
//! - **Meta**: consensus-replicated cluster topology (nodes, databases,
//!   retention policies, shard groups, shards) with an HTTP admin API
//! - **Coordinator**: maps query sources onto local and remote shards,
//!   streams remote iterators, and forwards writes to shard owners
//! - **Net**: one cluster TCP port shared by consensus and cluster RPC,
//!   split by a leading header byte
//!
//! The storage engine and query language live outside this crate; the
//! [`coordinator::ShardStore`] trait is the seam, with
//! [`storage::MemoryStore`] as the in-process implementation.

pub mod config;
pub mod coordinator;
pub mod meta;
pub mod net;
pub mod query;
pub mod storage;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::config::{Config, CoordinatorConfig, MetaConfig, ReconcilePolicy};
    pub use crate::coordinator::{ClusterService, ShardMapper, ShardMapping, ShardStore, ShardWriter};
    pub use crate::meta::{Command, MetaStore, TimeRange, TopologyReader};
    pub use crate::query::{FieldValue, IteratorOptions, Measurement, Point, QuerySource};
    pub use crate::storage::MemoryStore;
    pub use crate::{Error, Result};
}
