//! Persisted identity of the local meta node.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::Result;

const NODE_FILE: &str = "node.json";

/// `raft_id` is generated once and names this node inside the consensus
/// group. `id` is the topology node id, known after the node is registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub raft_id: u64,
    pub id: Option<u64>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl NodeIdentity {
    /// Load the identity from `dir`, creating a fresh one if absent.
    /// Without a directory the identity only lives for this process.
    pub fn load_or_create(dir: Option<&Path>) -> Result<Self> {
        let Some(dir) = dir else {
            return Ok(Self::fresh(None));
        };
        std::fs::create_dir_all(dir)?;
        let path = dir.join(NODE_FILE);
        if path.exists() {
            let mut identity: NodeIdentity = serde_json::from_slice(&std::fs::read(&path)?)?;
            identity.path = Some(path);
            return Ok(identity);
        }

        let identity = Self::fresh(Some(path));
        identity.save()?;
        info!(raft_id = identity.raft_id, "Created meta node identity");
        Ok(identity)
    }

    fn fresh(path: Option<PathBuf>) -> Self {
        // Zero is reserved so an unset id never matches a real member.
        let raft_id = loop {
            let id: u64 = rand::random();
            if id != 0 {
                break id;
            }
        };
        Self {
            raft_id,
            id: None,
            path,
        }
    }

    /// Write to disk via a temp file and rename.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = NodeIdentity::load_or_create(Some(dir.path())).unwrap();
        first.id = Some(4);
        first.save().unwrap();

        let second = NodeIdentity::load_or_create(Some(dir.path())).unwrap();
        assert_eq!(second.raft_id, first.raft_id);
        assert_eq!(second.id, Some(4));
    }

    #[test]
    fn in_memory_identity_is_random() {
        let a = NodeIdentity::load_or_create(None).unwrap();
        let b = NodeIdentity::load_or_create(None).unwrap();
        assert_ne!(a.raft_id, b.raft_id);
        assert!(a.save().is_ok());
    }
}
