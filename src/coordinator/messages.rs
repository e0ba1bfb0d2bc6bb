//! Cluster RPC messages. Each travels in one TLV frame tagged with its type
//! code.

use serde::{Deserialize, Serialize};

use crate::query::{DataType, FieldDimensions, IteratorOptions, IteratorStats, Measurement, Point};

pub const WRITE_SHARD_REQUEST: u8 = 1;
pub const WRITE_SHARD_RESPONSE: u8 = 2;
pub const CREATE_ITERATOR_REQUEST: u8 = 5;
pub const CREATE_ITERATOR_RESPONSE: u8 = 6;
pub const FIELD_DIMENSIONS_REQUEST: u8 = 7;
pub const FIELD_DIMENSIONS_RESPONSE: u8 = 8;
/// One point of a streamed iterator.
pub const ITERATOR_POINT: u8 = 9;
/// Terminates a streamed iterator.
pub const ITERATOR_END: u8 = 10;

/// Response code for an accepted write.
pub const WRITE_OK: u8 = 0;
/// Response code for a write the remote shard rejected.
pub const WRITE_FAILED: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteShardRequest {
    pub shard_id: u64,
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteShardResponse {
    pub code: u8,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateIteratorRequest {
    pub shard_ids: Vec<u64>,
    pub measurement: Measurement,
    pub options: IteratorOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateIteratorResponse {
    pub data_type: DataType,
    pub stats: IteratorStats,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IteratorEnd {
    pub stats: IteratorStats,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDimensionsRequest {
    pub shard_ids: Vec<u64>,
    pub measurement: Measurement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDimensionsResponse {
    pub field_dimensions: FieldDimensions,
    pub error: Option<String>,
}
