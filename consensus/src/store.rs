use crate::log::LogEntry;
use cortex_common::{CortexError, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Durable consensus state restored at boot
#[derive(Debug, Clone, Default)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub entries: Vec<LogEntry>,
}

/// Pluggable persistence backend for the three crash-safe consensus fields:
/// current term, vote, and the log. Every write must be durable before the
/// RPC that caused it is answered.
#[async_trait::async_trait]
pub trait RaftStore: Send + Sync {
    async fn load_term(&self) -> Result<u64>;
    async fn save_term(&self, term: u64) -> Result<()>;

    async fn load_vote(&self) -> Result<Option<NodeId>>;
    async fn save_vote(&self, vote: Option<NodeId>) -> Result<()>;

    async fn append_entries(&self, entries: &[LogEntry]) -> Result<()>;
    async fn truncate_suffix(&self, from_index: u64) -> Result<()>;
    async fn read_range(&self, from: u64, to: u64) -> Result<Vec<LogEntry>>;

    /// Restore everything at boot.
    async fn load_state(&self) -> Result<PersistentState> {
        Ok(PersistentState {
            current_term: self.load_term().await?,
            voted_for: self.load_vote().await?,
            entries: self.read_range(1, u64::MAX).await?,
        })
    }
}

/// Volatile backend for tests and deterministic simulations.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: parking_lot::Mutex<PersistentState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RaftStore for MemoryStore {
    async fn load_term(&self) -> Result<u64> {
        Ok(self.inner.lock().current_term)
    }

    async fn save_term(&self, term: u64) -> Result<()> {
        self.inner.lock().current_term = term;
        Ok(())
    }

    async fn load_vote(&self) -> Result<Option<NodeId>> {
        Ok(self.inner.lock().voted_for.clone())
    }

    async fn save_vote(&self, vote: Option<NodeId>) -> Result<()> {
        self.inner.lock().voted_for = vote;
        Ok(())
    }

    async fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        self.inner.lock().entries.extend_from_slice(entries);
        Ok(())
    }

    async fn truncate_suffix(&self, from_index: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.retain(|e| e.index < from_index);
        Ok(())
    }

    async fn read_range(&self, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        Ok(self
            .inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.index >= from && e.index <= to)
            .cloned()
            .collect())
    }
}

/// Magic number marking a log record boundary (helps detect corruption)
const LOG_RECORD_MAGIC: u32 = 0x52414654;

/// Cap on a single record read back from disk
const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct MetaRecord {
    current_term: u64,
    voted_for: Option<NodeId>,
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Append-only file-backed store.
///
/// Layout under `dir`: `meta.bin` (term + vote, rewritten atomically via
/// temp-file rename) and `log.bin` (crc-framed records, fsync on every
/// append). Truncating a suffix rewrites `log.bin` from the in-memory
/// mirror; truncations only happen on a conflicting uncommitted tail, so
/// the rewrite is rare and small.
pub struct FileStore {
    meta_path: PathBuf,
    log_path: PathBuf,
    meta: Mutex<MetaRecord>,
    log_file: Mutex<Option<File>>,
    mirror: Mutex<Vec<LogEntry>>,
}

impl FileStore {
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let meta_path = dir.join("meta.bin");
        let log_path = dir.join("log.bin");

        let meta = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| CortexError::Storage(format!("corrupt meta file: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MetaRecord {
                current_term: 0,
                voted_for: None,
            },
            Err(e) => return Err(e.into()),
        };

        let mirror = Self::replay(&log_path).await?;

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;

        info!(
            term = meta.current_term,
            entries = mirror.len(),
            "restored consensus state"
        );

        Ok(Self {
            meta_path,
            log_path,
            meta: Mutex::new(meta),
            log_file: Mutex::new(Some(log_file)),
            mirror: Mutex::new(mirror),
        })
    }

    /// Read every valid record; a torn tail write is dropped with a warning
    /// rather than failing recovery.
    async fn replay(path: &Path) -> Result<Vec<LogEntry>> {
        let file = match File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut entries: Vec<LogEntry> = Vec::new();

        loop {
            let mut header = [0u8; 12];
            match reader.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let length = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
            let expected_crc = u32::from_le_bytes(header[8..12].try_into().unwrap());

            if magic != LOG_RECORD_MAGIC || length > MAX_RECORD_BYTES {
                warn!("corrupt log record header; truncating replay here");
                break;
            }

            let mut data = vec![0u8; length];
            match reader.read_exact(&mut data).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!("torn log record at tail; dropping");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            if checksum(&data) != expected_crc {
                warn!("log record checksum mismatch; truncating replay here");
                break;
            }

            let entry: LogEntry = match bincode::deserialize(&data) {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "undecodable log record; truncating replay here");
                    break;
                }
            };

            // A record may supersede an earlier suffix (pre-truncate state)
            if let Some(last) = entries.last() {
                if entry.index <= last.index {
                    entries.retain(|e| e.index < entry.index);
                }
            }
            entries.push(entry);
        }

        Ok(entries)
    }

    fn encode_record(entry: &LogEntry) -> Result<Vec<u8>> {
        let data = bincode::serialize(entry)
            .map_err(|e| CortexError::Serialization(e.to_string()))?;
        let mut record = Vec::with_capacity(12 + data.len());
        record.extend_from_slice(&LOG_RECORD_MAGIC.to_le_bytes());
        record.extend_from_slice(&(data.len() as u32).to_le_bytes());
        record.extend_from_slice(&checksum(&data).to_le_bytes());
        record.extend_from_slice(&data);
        Ok(record)
    }

    async fn persist_meta(&self, meta: &MetaRecord) -> Result<()> {
        let bytes = bincode::serialize(meta)
            .map_err(|e| CortexError::Serialization(e.to_string()))?;
        let tmp = self.meta_path.with_extension("tmp");
        let mut file = File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, &self.meta_path).await?;
        Ok(())
    }

    /// Rewrite the whole log file from the mirror (used by truncate).
    async fn rewrite_log(&self, entries: &[LogEntry]) -> Result<()> {
        let tmp = self.log_path.with_extension("tmp");
        let mut file = File::create(&tmp).await?;
        for entry in entries {
            file.write_all(&Self::encode_record(entry)?).await?;
        }
        file.sync_all().await?;
        tokio::fs::rename(&tmp, &self.log_path).await?;

        let reopened = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        *self.log_file.lock().await = Some(reopened);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RaftStore for FileStore {
    async fn load_term(&self) -> Result<u64> {
        Ok(self.meta.lock().await.current_term)
    }

    async fn save_term(&self, term: u64) -> Result<()> {
        let mut meta = self.meta.lock().await;
        meta.current_term = term;
        self.persist_meta(&meta).await
    }

    async fn load_vote(&self) -> Result<Option<NodeId>> {
        Ok(self.meta.lock().await.voted_for.clone())
    }

    async fn save_vote(&self, vote: Option<NodeId>) -> Result<()> {
        let mut meta = self.meta.lock().await;
        meta.voted_for = vote;
        self.persist_meta(&meta).await
    }

    async fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buffer = Vec::new();
        for entry in entries {
            buffer.extend_from_slice(&Self::encode_record(entry)?);
        }

        {
            let mut guard = self.log_file.lock().await;
            let file = guard
                .as_mut()
                .ok_or_else(|| CortexError::Storage("log file closed".into()))?;
            file.write_all(&buffer).await?;
            file.sync_all().await?;
        }

        self.mirror.lock().await.extend_from_slice(entries);
        Ok(())
    }

    async fn truncate_suffix(&self, from_index: u64) -> Result<()> {
        let mut mirror = self.mirror.lock().await;
        mirror.retain(|e| e.index < from_index);
        self.rewrite_log(&mirror).await
    }

    async fn read_range(&self, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        Ok(self
            .mirror
            .lock()
            .await
            .iter()
            .filter(|e| e.index >= from && e.index <= to)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::EntryKind;
    use tempfile::tempdir;

    fn entry(index: u64, term: u64, payload: &[u8]) -> LogEntry {
        LogEntry {
            index,
            term,
            kind: EntryKind::StateOp,
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.save_term(3).await.unwrap();
        store.save_vote(Some(NodeId("n2".into()))).await.unwrap();
        store
            .append_entries(&[entry(1, 1, b"a"), entry(2, 3, b"b")])
            .await
            .unwrap();

        let state = store.load_state().await.unwrap();
        assert_eq!(state.current_term, 3);
        assert_eq!(state.voted_for, Some(NodeId("n2".into())));
        assert_eq!(state.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();

        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.save_term(5).await.unwrap();
            store.save_vote(Some(NodeId("peer".into()))).await.unwrap();
            store
                .append_entries(&[entry(1, 4, b"x"), entry(2, 5, b"y")])
                .await
                .unwrap();
        }

        let store = FileStore::open(dir.path()).await.unwrap();
        let state = store.load_state().await.unwrap();
        assert_eq!(state.current_term, 5);
        assert_eq!(state.voted_for, Some(NodeId("peer".into())));
        assert_eq!(state.entries, vec![entry(1, 4, b"x"), entry(2, 5, b"y")]);
    }

    #[tokio::test]
    async fn test_file_store_truncate_suffix() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store
            .append_entries(&[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
            .await
            .unwrap();

        store.truncate_suffix(2).await.unwrap();
        store.append_entries(&[entry(2, 2, b"z")]).await.unwrap();

        let range = store.read_range(1, u64::MAX).await.unwrap();
        assert_eq!(range, vec![entry(1, 1, b"a"), entry(2, 2, b"z")]);

        // still true after reopen
        drop(store);
        let store = FileStore::open(dir.path()).await.unwrap();
        let range = store.read_range(1, u64::MAX).await.unwrap();
        assert_eq!(range, vec![entry(1, 1, b"a"), entry(2, 2, b"z")]);
    }

    #[tokio::test]
    async fn test_file_store_tolerates_torn_tail() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store
                .append_entries(&[entry(1, 1, b"a"), entry(2, 1, b"b")])
                .await
                .unwrap();
        }

        // chop bytes off the tail to simulate a crash mid-write
        let log_path = dir.path().join("log.bin");
        let bytes = std::fs::read(&log_path).unwrap();
        std::fs::write(&log_path, &bytes[..bytes.len() - 5]).unwrap();

        let store = FileStore::open(dir.path()).await.unwrap();
        let range = store.read_range(1, u64::MAX).await.unwrap();
        assert_eq!(range, vec![entry(1, 1, b"a")]);
    }
}
