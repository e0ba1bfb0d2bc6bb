//! Local shard storage.

mod memory;

pub use memory::{MemoryShardGroup, MemoryStore};
