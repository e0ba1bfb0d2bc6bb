//! Raft log storage for the meta store.
//!
//! Entries live in a `BTreeMap`. When a directory is configured they are
//! also appended to `raft.log` as `[len: u32 LE][crc32: u32 LE][JSON]`
//! records, and the vote and purge marker are kept in `raft_state.json`.
//! A torn record at the tail is treated as the crash point.

use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32fast::Hasher;
use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{Entry, LogId, RaftLogId, StorageError, StorageIOError, Vote};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::consensus::TypeConfig;
use crate::{Error, Result};

const LOG_FILE: &str = "raft.log";
const STATE_FILE: &str = "raft_state.json";
const RECORD_HEADER_LEN: usize = 8;

#[derive(Debug, Default, Serialize, Deserialize)]
struct HardState {
    vote: Option<Vote<u64>>,
    purged: Option<LogId<u64>>,
}

struct LogStoreInner {
    state: HardState,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    dir: Option<PathBuf>,
}

/// Log store shared between openraft's writer and its readers.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<Mutex<LogStoreInner>>,
}

impl LogStore {
    /// Volatile log.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogStoreInner {
                state: HardState::default(),
                log: BTreeMap::new(),
                dir: None,
            })),
        }
    }

    /// Open or create a log persisted under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let state_path = dir.join(STATE_FILE);
        let state = if state_path.exists() {
            serde_json::from_slice(&std::fs::read(&state_path)?)?
        } else {
            HardState::default()
        };

        let mut log = BTreeMap::new();
        let log_path = dir.join(LOG_FILE);
        if log_path.exists() {
            for entry in read_records(&log_path)? {
                log.insert(entry.get_log_id().index, entry);
            }
        }
        debug!(dir = ?dir, entries = log.len(), "Opened raft log");

        Ok(Self {
            inner: Arc::new(Mutex::new(LogStoreInner {
                state,
                log,
                dir: Some(dir.to_path_buf()),
            })),
        })
    }
}

impl LogStoreInner {
    async fn persist_state(&self) -> std::io::Result<()> {
        let Some(dir) = &self.dir else { return Ok(()) };
        let bytes = serde_json::to_vec(&self.state)?;
        write_atomic(&dir.join(STATE_FILE), &bytes).await
    }

    async fn append_records(&self, entries: &[Entry<TypeConfig>]) -> std::io::Result<()> {
        let Some(dir) = &self.dir else { return Ok(()) };
        let mut buf = Vec::new();
        for entry in entries {
            encode_record(entry, &mut buf)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .await?;
        file.write_all(&buf).await?;
        file.sync_data().await
    }

    /// Rewrite the log file from memory after a truncate or purge.
    async fn rewrite_records(&self) -> std::io::Result<()> {
        let Some(dir) = &self.dir else { return Ok(()) };
        let mut buf = Vec::new();
        for entry in self.log.values() {
            encode_record(entry, &mut buf)?;
        }
        write_atomic(&dir.join(LOG_FILE), &buf).await
    }
}

fn encode_record(entry: &Entry<TypeConfig>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let payload = serde_json::to_vec(entry)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<Entry<TypeConfig>>> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    let mut entries = Vec::new();
    loop {
        let mut header = [0u8; RECORD_HEADER_LEN];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::Io(e)),
        }
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).is_err() {
            warn!(
                "Truncated raft log record in {:?} after {} entries - treating as crash point",
                path,
                entries.len()
            );
            break;
        }
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != crc {
            warn!(
                "Raft log checksum mismatch in {:?} after {} entries - treating as crash point",
                path,
                entries.len()
            );
            break;
        }
        entries.push(serde_json::from_slice(&payload)?);
    }
    Ok(entries)
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_data().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

fn storage_err(source: StorageIOError<u64>) -> StorageError<u64> {
    StorageError::IO { source }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Send>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let inner = self.inner.lock().await;
        Ok(inner.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(
        &mut self,
    ) -> std::result::Result<LogState<TypeConfig>, StorageError<u64>> {
        let inner = self.inner.lock().await;
        let last = inner
            .log
            .iter()
            .next_back()
            .map(|(_, e)| *e.get_log_id())
            .or(inner.state.purged);
        Ok(LogState {
            last_purged_log_id: inner.state.purged,
            last_log_id: last,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> std::result::Result<(), StorageError<u64>> {
        let mut inner = self.inner.lock().await;
        inner.state.vote = Some(*vote);
        inner
            .persist_state()
            .await
            .map_err(|e| storage_err(StorageIOError::write_vote(&e)))
    }

    async fn read_vote(&mut self) -> std::result::Result<Option<Vote<u64>>, StorageError<u64>> {
        Ok(self.inner.lock().await.state.vote)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> std::result::Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut inner = self.inner.lock().await;
        let entries: Vec<Entry<TypeConfig>> = entries.into_iter().collect();
        let flushed = inner.append_records(&entries).await;
        if let Err(e) = &flushed {
            let err = std::io::Error::new(e.kind(), e.to_string());
            callback.log_io_completed(Err(err));
            return Err(storage_err(StorageIOError::write_logs(e)));
        }
        for entry in entries {
            inner.log.insert(entry.get_log_id().index, entry);
        }
        drop(inner);
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<u64>) -> std::result::Result<(), StorageError<u64>> {
        let mut inner = self.inner.lock().await;
        let _removed = inner.log.split_off(&log_id.index);
        inner
            .rewrite_records()
            .await
            .map_err(|e| storage_err(StorageIOError::write_logs(&e)))
    }

    async fn purge(&mut self, log_id: LogId<u64>) -> std::result::Result<(), StorageError<u64>> {
        let mut inner = self.inner.lock().await;
        let keep = inner.log.split_off(&(log_id.index + 1));
        inner.log = keep;
        inner.state.purged = Some(log_id);
        inner
            .persist_state()
            .await
            .map_err(|e| storage_err(StorageIOError::write_logs(&e)))?;
        inner
            .rewrite_records()
            .await
            .map_err(|e| storage_err(StorageIOError::write_logs(&e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::{CommittedLeaderId, EntryPayload};

    fn blank(index: u64) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Blank,
        }
    }

    #[tokio::test]
    async fn persisted_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LogStore::open(dir.path()).unwrap();
            let mut inner = store.inner.lock().await;
            let entries = vec![blank(1), blank(2), blank(3)];
            inner.append_records(&entries).await.unwrap();
            for e in entries {
                inner.log.insert(e.log_id.index, e);
            }
            inner.state.vote = Some(Vote::new(1, 1));
            inner.persist_state().await.unwrap();
        }

        let mut store = LogStore::open(dir.path()).unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.map(|l| l.index), Some(3));
        assert_eq!(store.read_vote().await.unwrap(), Some(Vote::new(1, 1)));

        store
            .truncate(LogId::new(CommittedLeaderId::new(1, 1), 2))
            .await
            .unwrap();
        let reopened = LogStore::open(dir.path()).unwrap();
        assert_eq!(reopened.inner.lock().await.log.len(), 1);
    }

    #[tokio::test]
    async fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = Vec::new();
        encode_record(&blank(1), &mut buf).unwrap();
        encode_record(&blank(2), &mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        std::fs::write(dir.path().join(LOG_FILE), &buf).unwrap();

        let store = LogStore::open(dir.path()).unwrap();
        let inner = store.inner.lock().await;
        assert_eq!(inner.log.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn purge_keeps_last_purged_id() {
        let mut store = LogStore::in_memory();
        {
            let mut inner = store.inner.lock().await;
            for i in 1..=4 {
                inner.log.insert(i, blank(i));
            }
        }
        store
            .purge(LogId::new(CommittedLeaderId::new(1, 1), 2))
            .await
            .unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.map(|l| l.index), Some(2));
        assert_eq!(state.last_log_id.map(|l| l.index), Some(4));
        let entries = store.try_get_log_entries(0..10).await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}
