//! Task store: durable `TaskState` snapshots keyed by task id.
//!
//! Values are stored as a JSON envelope carrying an expiry timestamp; an
//! expired entry reads as absent. The workflow engine treats every store
//! error as "persistence unavailable" and keeps running in memory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::TaskState;

/// Error type for task store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[cfg(feature = "heavy-state")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

/// Result type for task store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a task store
pub type SharedTaskStore = Arc<dyn TaskStore>;

/// Durable key/value storage for task state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Load a task. Missing and expired entries are `Ok(None)`.
    async fn get(&self, task_id: &str) -> StoreResult<Option<TaskState>>;

    /// Store a task, replacing any previous snapshot.
    async fn set(&self, task_id: &str, state: &TaskState, ttl: Duration) -> StoreResult<()>;

    /// Store name for logging.
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    expires_at: DateTime<Utc>,
    state: TaskState,
}

impl Envelope {
    fn new(state: &TaskState, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            expires_at: Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            state: state.clone(),
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn encode(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store. Durable only for the life of the process.
#[derive(Default)]
pub struct InMemoryTaskStore {
    entries: RwLock<HashMap<String, Envelope>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedTaskStore {
        Arc::new(self)
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get(&self, task_id: &str) -> StoreResult<Option<TaskState>> {
        {
            let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
            match entries.get(task_id) {
                None => return Ok(None),
                Some(envelope) if !envelope.is_expired() => return Ok(Some(envelope.state.clone())),
                Some(_) => {}
            }
        }
        self.entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .remove(task_id);
        debug!(task_id, "evicted expired task");
        Ok(None)
    }

    async fn set(&self, task_id: &str, state: &TaskState, ttl: Duration) -> StoreResult<()> {
        self.entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(task_id.to_string(), Envelope::new(state, ttl));
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// File store
// ============================================================================

/// One JSON file per task under a directory.
pub struct FileTaskStore {
    dir: PathBuf,
}

impl FileTaskStore {
    /// Open or create a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn shared(self) -> SharedTaskStore {
        Arc::new(self)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        let file: String = task_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn get(&self, task_id: &str) -> StoreResult<Option<TaskState>> {
        let path = self.path_for(task_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope = Envelope::decode(&bytes)?;
        if envelope.is_expired() {
            tokio::fs::remove_file(&path).await.ok();
            debug!(task_id, "evicted expired task file");
            return Ok(None);
        }
        Ok(Some(envelope.state))
    }

    async fn set(&self, task_id: &str, state: &TaskState, ttl: Duration) -> StoreResult<()> {
        let path = self.path_for(task_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, Envelope::new(state, ttl).encode()?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

// ============================================================================
// RocksDB store
// ============================================================================

#[cfg(feature = "heavy-state")]
pub use rocks::RocksTaskStore;

#[cfg(feature = "heavy-state")]
mod rocks {
    use super::*;
    use rocksdb::{ColumnFamilyDescriptor, Options, DB};

    const CF_TASKS: &str = "tasks";

    /// RocksDB-backed store with a single `tasks` column family.
    pub struct RocksTaskStore {
        db: RwLock<DB>,
        path: PathBuf,
    }

    impl RocksTaskStore {
        /// Open or create a store at the given path
        pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
            let path = path.into();

            let mut opts = Options::default();
            opts.create_if_missing(true);
            opts.create_missing_column_families(true);

            let cfs = vec![ColumnFamilyDescriptor::new(CF_TASKS, Options::default())];
            let db = DB::open_cf_descriptors(&opts, &path, cfs)?;

            Ok(Self {
                db: RwLock::new(db),
                path,
            })
        }

        pub fn shared(self) -> SharedTaskStore {
            Arc::new(self)
        }

        pub fn path(&self) -> &PathBuf {
            &self.path
        }
    }

    #[async_trait]
    impl TaskStore for RocksTaskStore {
        async fn get(&self, task_id: &str) -> StoreResult<Option<TaskState>> {
            let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
            let cf = db
                .cf_handle(CF_TASKS)
                .ok_or_else(|| StoreError::Unavailable(format!("column family {CF_TASKS} missing")))?;
            let Some(bytes) = db.get_cf(cf, task_id.as_bytes())? else {
                return Ok(None);
            };
            let envelope = Envelope::decode(&bytes)?;
            if envelope.is_expired() {
                db.delete_cf(cf, task_id.as_bytes())?;
                return Ok(None);
            }
            Ok(Some(envelope.state))
        }

        async fn set(&self, task_id: &str, state: &TaskState, ttl: Duration) -> StoreResult<()> {
            let bytes = Envelope::new(state, ttl).encode()?;
            let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
            let cf = db
                .cf_handle(CF_TASKS)
                .ok_or_else(|| StoreError::Unavailable(format!("column family {CF_TASKS} missing")))?;
            db.put_cf(cf, task_id.as_bytes(), bytes)?;
            Ok(())
        }

        fn name(&self) -> &str {
            "rocksdb"
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::state::types::Stage;

        #[tokio::test]
        async fn test_rocks_round_trip() {
            let dir = tempfile::tempdir().unwrap();
            let store = RocksTaskStore::open(dir.path()).unwrap();
            let mut state = TaskState::new("t1", "input");
            state.current_stage = Stage::Review;
            store.set("t1", &state, Duration::from_secs(60)).await.unwrap();
            assert_eq!(store.get("t1").await.unwrap(), Some(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::Stage;

    fn sample_state() -> TaskState {
        let mut state = TaskState::new("task/1", "build a lexer");
        state.current_stage = Stage::Complete;
        state.iteration_count = 2;
        state.final_output = Some("fn lex() {}".into());
        state
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        let store = InMemoryTaskStore::new();
        let state = sample_state();
        store.set(&state.task_id, &state, Duration::from_secs(60)).await.unwrap();

        let loaded = store.get(&state.task_id).await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_ttl_expiry() {
        let store = InMemoryTaskStore::new();
        let state = sample_state();
        store.set(&state.task_id, &state, Duration::ZERO).await.unwrap();
        assert!(store.get(&state.task_id).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path().join("tasks")).await.unwrap();
        let state = sample_state();
        store.set(&state.task_id, &state, Duration::from_secs(60)).await.unwrap();

        // Reopen to prove the data is on disk.
        let reopened = FileTaskStore::open(dir.path().join("tasks")).await.unwrap();
        let loaded = reopened.get(&state.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.current_stage, Stage::Complete);
        assert_eq!(loaded.iteration_count, 2);
        assert_eq!(loaded.final_output.as_deref(), Some("fn lex() {}"));
    }

    #[tokio::test]
    async fn test_file_overwrite_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).await.unwrap();
        let mut state = sample_state();
        store.set("t", &state, Duration::from_secs(60)).await.unwrap();
        state.iteration_count = 3;
        store.set("t", &state, Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("t").await.unwrap().unwrap().iteration_count, 3);

        store.set("t", &state, Duration::ZERO).await.unwrap();
        assert!(store.get("t").await.unwrap().is_none());
        assert!(!store.path_for("t").exists());
    }

    #[tokio::test]
    async fn test_file_corrupt_entry_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).await.unwrap();
        tokio::fs::write(store.path_for("bad"), b"not json").await.unwrap();
        assert!(matches!(store.get("bad").await, Err(StoreError::Deserialization(_))));
    }
}
