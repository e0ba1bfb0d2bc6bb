//! Consensus state machine: applies committed commands to the shared topology.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use metrics::counter;
use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, Membership, RaftLogId, RaftSnapshotBuilder,
    SnapshotMeta, StorageError, StorageIOError, StoredMembership,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::command::CommandEnvelope;
use super::consensus::{MetaResponse, TypeConfig};
use super::data::Data;
use super::log_store::write_atomic;
use crate::Result;

const SNAPSHOT_FILE: &str = "snapshot.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<u64, BasicNode>,
    data: Vec<u8>,
}

/// Applies entries into the `Data` shared with the store's readers and
/// publishes every index change on a watch channel.
pub struct StateMachine {
    data: Arc<RwLock<Data>>,
    index_tx: watch::Sender<u64>,
    last_applied: Option<LogId<u64>>,
    last_membership: StoredMembership<u64, BasicNode>,
    current_snapshot: Arc<Mutex<Option<StoredSnapshot>>>,
    snapshot_idx: u64,
    dir: Option<PathBuf>,
}

impl StateMachine {
    /// Create a state machine, restoring the persisted snapshot under `dir`
    /// when one exists.
    pub fn open(
        data: Arc<RwLock<Data>>,
        index_tx: watch::Sender<u64>,
        dir: Option<&Path>,
    ) -> Result<Self> {
        let mut sm = Self {
            data,
            index_tx,
            last_applied: None,
            last_membership: StoredMembership::new(None, Membership::new(vec![], None)),
            current_snapshot: Arc::new(Mutex::new(None)),
            snapshot_idx: 0,
            dir: dir.map(Path::to_path_buf),
        };

        if let Some(dir) = dir {
            let path = dir.join(SNAPSHOT_FILE);
            if path.exists() {
                let stored: StoredSnapshot = serde_json::from_slice(&std::fs::read(&path)?)?;
                let restored: Data = serde_json::from_slice(&stored.data)?;
                info!(
                    index = restored.index,
                    last_log = ?stored.meta.last_log_id,
                    "Restored meta snapshot"
                );
                sm.restore(restored, &stored.meta);
                sm.current_snapshot = Arc::new(Mutex::new(Some(stored)));
            }
        }
        Ok(sm)
    }

    fn restore(&mut self, data: Data, meta: &SnapshotMeta<u64, BasicNode>) {
        let index = data.index;
        *self.data.write() = data;
        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        self.index_tx.send_replace(index);
    }

    fn apply_command(&self, bytes: &[u8]) -> MetaResponse {
        let envelope = match CommandEnvelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Undecodable meta command");
                return MetaResponse {
                    index: self.data.read().index,
                    error: Some(e.to_string()),
                };
            }
        };

        let name = envelope.command.name();
        let result = {
            let mut data = self.data.write();
            data.apply(&envelope.command).map(|_| data.index)
        };
        match result {
            Ok(index) => {
                counter!("tidemark_meta_commands_applied_total", "command" => name).increment(1);
                debug!(command = name, index, "Applied meta command");
                self.index_tx.send_replace(index);
                MetaResponse { index, error: None }
            }
            Err(e) => {
                counter!("tidemark_meta_commands_rejected_total", "command" => name).increment(1);
                debug!(command = name, error = %e, "Meta command rejected");
                MetaResponse {
                    index: self.data.read().index,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

async fn persist_snapshot(dir: &Option<PathBuf>, snapshot: &StoredSnapshot) -> std::io::Result<()> {
    let Some(dir) = dir else { return Ok(()) };
    let bytes = serde_json::to_vec(snapshot)?;
    write_atomic(&dir.join(SNAPSHOT_FILE), &bytes).await
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = SnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> std::result::Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> std::result::Result<Vec<MetaResponse>, StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut responses = Vec::new();
        for entry in entries {
            self.last_applied = Some(*entry.get_log_id());

            match entry.payload {
                EntryPayload::Blank => responses.push(MetaResponse {
                    index: self.data.read().index,
                    error: None,
                }),
                EntryPayload::Normal(ref req) => responses.push(self.apply_command(&req.command)),
                EntryPayload::Membership(ref mem) => {
                    self.last_membership = StoredMembership::new(Some(*entry.get_log_id()), mem.clone());
                    responses.push(MetaResponse {
                        index: self.data.read().index,
                        error: None,
                    });
                }
            }
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.snapshot_idx += 1;
        SnapshotBuilder {
            data: self.data.read().clone(),
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            snapshot_idx: self.snapshot_idx,
            current_snapshot: self.current_snapshot.clone(),
            dir: self.dir.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> std::result::Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> std::result::Result<(), StorageError<u64>> {
        let stored = StoredSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };
        let data: Data = serde_json::from_slice(&stored.data).map_err(|e| StorageError::IO {
            source: StorageIOError::read_snapshot(Some(meta.signature()), &e),
        })?;

        info!(
            index = data.index,
            snapshot_id = %meta.snapshot_id,
            "Installing meta snapshot"
        );
        self.restore(data, meta);
        persist_snapshot(&self.dir, &stored)
            .await
            .map_err(|e| StorageError::IO {
                source: StorageIOError::write_snapshot(Some(meta.signature()), &e),
            })?;
        *self.current_snapshot.lock().await = Some(stored);
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> std::result::Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        match &*self.current_snapshot.lock().await {
            Some(snap) => Ok(Some(Snapshot {
                meta: snap.meta.clone(),
                snapshot: Box::new(Cursor::new(snap.data.clone())),
            })),
            None => Ok(None),
        }
    }
}

/// Point-in-time copy of the topology taken when openraft asks for a builder.
pub struct SnapshotBuilder {
    data: Data,
    last_applied: Option<LogId<u64>>,
    last_membership: StoredMembership<u64, BasicNode>,
    snapshot_idx: u64,
    current_snapshot: Arc<Mutex<Option<StoredSnapshot>>>,
    dir: Option<PathBuf>,
}

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilder {
    async fn build_snapshot(&mut self) -> std::result::Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let data = serde_json::to_vec(&self.data).map_err(|e| StorageError::IO {
            source: StorageIOError::read_state_machine(&e),
        })?;

        let snapshot_id = format!(
            "{}-{}",
            self.last_applied.map_or(0, |id| id.index),
            self.snapshot_idx
        );
        let meta = SnapshotMeta {
            last_log_id: self.last_applied,
            last_membership: self.last_membership.clone(),
            snapshot_id,
        };
        let stored = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };

        persist_snapshot(&self.dir, &stored)
            .await
            .map_err(|e| StorageError::IO {
                source: StorageIOError::write_snapshot(Some(meta.signature()), &e),
            })?;
        *self.current_snapshot.lock().await = Some(stored);
        debug!(snapshot_id = %meta.snapshot_id, index = self.data.index, "Built meta snapshot");

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::command::Command;
    use crate::meta::consensus::MetaRequest;
    use openraft::CommittedLeaderId;

    fn normal(index: u64, command: Command) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(MetaRequest {
                command: CommandEnvelope::new(command).encode().unwrap(),
            }),
        }
    }

    fn state_machine(dir: Option<&Path>) -> (StateMachine, Arc<RwLock<Data>>, watch::Receiver<u64>) {
        let data = Arc::new(RwLock::new(Data::default()));
        let (tx, rx) = watch::channel(0);
        let sm = StateMachine::open(data.clone(), tx, dir).unwrap();
        (sm, data, rx)
    }

    #[tokio::test]
    async fn rejected_commands_keep_index() {
        let (mut sm, data, rx) = state_machine(None);
        let responses = sm
            .apply(vec![
                normal(1, Command::CreateDatabase { name: "db0".into(), retention_policy: None }),
                normal(2, Command::DropDatabase { name: "nope".into() }),
                normal(3, Command::DropDatabase { name: "db0".into() }),
            ])
            .await
            .unwrap();

        assert_eq!(responses[0].index, 1);
        assert!(responses[1].error.is_some());
        assert_eq!(responses[1].index, 1);
        assert_eq!(responses[2].index, 2);
        assert_eq!(data.read().index, 2);
        assert_eq!(*rx.borrow(), 2);
        assert_eq!(sm.last_applied.map(|l| l.index), Some(3));
    }

    #[tokio::test]
    async fn snapshot_persists_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut sm, _data, _rx) = state_machine(Some(dir.path()));
            sm.apply(vec![normal(
                1,
                Command::CreateDatabase { name: "db0".into(), retention_policy: None },
            )])
            .await
            .unwrap();
            let mut builder = sm.get_snapshot_builder().await;
            builder.build_snapshot().await.unwrap();
        }

        let (mut sm, data, rx) = state_machine(Some(dir.path()));
        assert!(data.read().database("db0").is_some());
        assert_eq!(*rx.borrow(), 1);
        let (applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(applied.map(|l| l.index), Some(1));
        assert!(sm.get_current_snapshot().await.unwrap().is_some());
    }
}
