//! Query-side types consumed by the coordinator
//!
//! The query language front end is external; this module holds the values
//! it hands to the shard mapper (sources, measurements, iterator options)
//! and the iterator abstraction the mapper hands back.

mod iterator;
mod types;

pub use iterator::{close_all, collect_points, merge, BoxIterator, MergeIterator, PointIterator, VecIterator};
pub use types::{
    DataType, FieldDimensions, FieldValue, IteratorCost, IteratorOptions, IteratorStats,
    Measurement, Point, QuerySource,
};
