//! Commands replicated through the consensus log.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for a new retention policy; unset fields take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicySpec {
    pub name: String,
    pub duration: Option<Duration>,
    pub shard_group_duration: Option<Duration>,
    pub replica_n: Option<usize>,
}

impl RetentionPolicySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            duration: None,
            shard_group_duration: None,
            replica_n: None,
        }
    }
}

/// A topology mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    CreateMetaNode {
        host: String,
        tcp_host: String,
    },
    SetMetaNode {
        host: String,
        tcp_host: String,
    },
    DeleteMetaNode {
        id: u64,
    },
    CreateDataNode {
        host: String,
        tcp_host: String,
    },
    DeleteDataNode {
        id: u64,
    },
    CreateDatabase {
        name: String,
        retention_policy: Option<RetentionPolicySpec>,
    },
    DropDatabase {
        name: String,
    },
    CreateRetentionPolicy {
        database: String,
        policy: RetentionPolicySpec,
        make_default: bool,
    },
    DropRetentionPolicy {
        database: String,
        name: String,
    },
    SetDefaultRetentionPolicy {
        database: String,
        name: String,
    },
    CreateShardGroup {
        database: String,
        policy: String,
        timestamp: i64,
    },
    DeleteShardGroup {
        database: String,
        policy: String,
        id: u64,
        deleted_at: i64,
    },
    DropShard {
        id: u64,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateMetaNode { .. } => "create_meta_node",
            Command::SetMetaNode { .. } => "set_meta_node",
            Command::DeleteMetaNode { .. } => "delete_meta_node",
            Command::CreateDataNode { .. } => "create_data_node",
            Command::DeleteDataNode { .. } => "delete_data_node",
            Command::CreateDatabase { .. } => "create_database",
            Command::DropDatabase { .. } => "drop_database",
            Command::CreateRetentionPolicy { .. } => "create_retention_policy",
            Command::DropRetentionPolicy { .. } => "drop_retention_policy",
            Command::SetDefaultRetentionPolicy { .. } => "set_default_retention_policy",
            Command::CreateShardGroup { .. } => "create_shard_group",
            Command::DeleteShardGroup { .. } => "delete_shard_group",
            Command::DropShard { .. } => "drop_shard",
        }
    }
}

/// Wire form of a command. The nonce keeps retried submissions of an
/// otherwise identical command distinguishable in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub nonce: u64,
    pub command: Command,
}

impl CommandEnvelope {
    pub fn new(command: Command) -> Self {
        Self {
            nonce: rand::random(),
            command,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
