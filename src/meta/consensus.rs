//! Openraft type configuration for the meta store.

use std::io::Cursor;

use openraft::BasicNode;
use serde::{Deserialize, Serialize};

/// Log entry payload: an encoded [`CommandEnvelope`](super::CommandEnvelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaRequest {
    pub command: Vec<u8>,
}

/// Result of applying one entry. `index` is the topology index after apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaResponse {
    pub index: u64,
    pub error: Option<String>,
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = MetaRequest,
        R            = MetaResponse,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

pub type MetaRaft = openraft::Raft<TypeConfig>;
