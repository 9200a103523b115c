//! Persistent settings for the Active and Pending datasets
//!
//! Each dataset kind is one record: the encoded TLVs, the remaining delay
//! (Pending only) and the wall-clock time of the write. Records are bincode
//! encoded. A write either fully replaces the previous record or leaves it
//! untouched.

use std::{
    collections::HashMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::{
    dataset::DatasetKind,
    error::{StorageError, StorageResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettingsKey {
    ActiveDataset,
    PendingDataset,
}

impl SettingsKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActiveDataset => "active_dataset",
            Self::PendingDataset => "pending_dataset",
        }
    }
}

impl From<DatasetKind> for SettingsKey {
    fn from(kind: DatasetKind) -> Self {
        match kind {
            DatasetKind::Active => Self::ActiveDataset,
            DatasetKind::Pending => Self::PendingDataset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDataset {
    pub tlvs: Vec<u8>,
    /// Remaining delay as of `saved_at`. Pending records only.
    pub delay_remaining_ms: Option<u32>,
    pub saved_at: DateTime<Utc>,
}

impl PersistedDataset {
    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        bincode::deserialize(bytes).map_err(|e| StorageError::Corrupt(e.to_string()))
    }
}

/// Key/value settings backend owned by the dataset managers.
pub trait SettingsStore: Send + Sync + 'static {
    fn read(&self, key: SettingsKey) -> StorageResult<Option<PersistedDataset>>;

    fn write(&self, key: SettingsKey, record: &PersistedDataset) -> StorageResult<()>;

    fn delete(&self, key: SettingsKey) -> StorageResult<()>;

    fn backend_name(&self) -> &'static str;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Volatile store. Writes can be made to fail for exercising error paths.
#[derive(Debug, Default)]
pub struct MemorySettings {
    records: RwLock<HashMap<SettingsKey, Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
    writes: AtomicU64,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail deletes only; writes keep succeeding.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SettingsStore for MemorySettings {
    fn read(&self, key: SettingsKey) -> StorageResult<Option<PersistedDataset>> {
        self.records
            .read()
            .get(&key)
            .map(|bytes| PersistedDataset::from_bytes(bytes))
            .transpose()
    }

    fn write(&self, key: SettingsKey, record: &PersistedDataset) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!(
                "write of {} refused",
                key.as_str()
            )));
        }
        let bytes = record.to_bytes()?;
        self.records.write().insert(key, bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, key: SettingsKey) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) || self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!(
                "delete of {} refused",
                key.as_str()
            )));
        }
        self.records.write().remove(&key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// File backend
// ============================================================================

/// One file per record under `dir`, replaced through a temp file rename.
#[derive(Debug, Clone)]
pub struct FileSettings {
    dir: PathBuf,
}

impl FileSettings {
    pub fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: SettingsKey) -> PathBuf {
        self.dir.join(format!("{}.bin", key.as_str()))
    }
}

impl SettingsStore for FileSettings {
    fn read(&self, key: SettingsKey) -> StorageResult<Option<PersistedDataset>> {
        let path = self.path(key);
        match fs::read(&path) {
            Ok(bytes) => PersistedDataset::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    fn write(&self, key: SettingsKey, record: &PersistedDataset) -> StorageResult<()> {
        let path = self.path(key);
        let bytes = record.to_bytes()?;
        let io_err = |source| StorageError::Io {
            path: path.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        debug!(key = key.as_str(), bytes = bytes.len(), "persisted dataset record");
        Ok(())
    }

    fn delete(&self, key: SettingsKey) -> StorageResult<()> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}

// ============================================================================
// No-op backend
// ============================================================================

/// Persistence disabled: nothing survives a restart.
#[derive(Debug, Clone, Default)]
pub struct NoOpSettings;

impl SettingsStore for NoOpSettings {
    fn read(&self, _key: SettingsKey) -> StorageResult<Option<PersistedDataset>> {
        Ok(None)
    }

    fn write(&self, key: SettingsKey, _record: &PersistedDataset) -> StorageResult<()> {
        warn!(key = key.as_str(), "persistence disabled, record dropped");
        Ok(())
    }

    fn delete(&self, _key: SettingsKey) -> StorageResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "noop"
    }
}
