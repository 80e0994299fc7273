//! Durable transfer state: task records plus raw per-chunk bytes
//!
//! Chunks are stored exactly as fetched (still encrypted) for downloads, and
//! as the content digest of the submitted slice for uploads. A task's chunk
//! set is keyed by `(task id, chunk index)`; saving the same index twice
//! overwrites.

mod fs;
mod memory;
#[cfg(feature = "rocksdb")]
mod rocks;

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use rcx_core::config::{expand_tilde, StateConfig, StateKind};
use rcx_core::types::TransferTask;
use rcx_core::TransferError;

pub use fs::FsStore;
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksStore;

const SECS_PER_DAY: u64 = 86_400;

/// Bytes held by a store against its optional quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    pub used: u64,
    pub quota: Option<u64>,
}

/// Persistence seam for the orchestrator.
///
/// Methods take `&self`; implementations lock internally so one store can be
/// shared by every task of a process.
pub trait TransferStore: Send + Sync {
    fn save_task(&self, task: &TransferTask) -> Result<(), TransferError>;

    fn get_task(&self, id: &str) -> Result<Option<TransferTask>, TransferError>;

    /// Every persisted task that is not completed or cancelled, oldest first.
    fn list_pending_tasks(&self) -> Result<Vec<TransferTask>, TransferError>;

    fn delete_task(&self, id: &str) -> Result<(), TransferError>;

    /// Idempotent: saving an index twice keeps the last bytes.
    fn save_chunk(&self, task_id: &str, index: usize, data: &[u8]) -> Result<(), TransferError>;

    fn get_chunks(&self, task_id: &str) -> Result<BTreeMap<usize, Bytes>, TransferError>;

    fn get_chunk(&self, task_id: &str, index: usize) -> Result<Option<Bytes>, TransferError>;

    /// Indices held for a task, without reading their bytes.
    fn chunk_indices(&self, task_id: &str) -> Result<BTreeSet<usize>, TransferError>;

    fn chunk_count(&self, task_id: &str) -> Result<usize, TransferError>;

    fn delete_chunks(&self, task_id: &str) -> Result<(), TransferError>;

    fn clear_all(&self, task_id: &str) -> Result<(), TransferError> {
        self.delete_chunks(task_id)?;
        self.delete_task(task_id)
    }

    /// Remove tasks created more than `max_age_days` ago with their chunks,
    /// and orphaned chunk sets not written to within that window. Returns
    /// the number of transfer ids swept.
    fn cleanup_expired(&self, max_age_days: u32) -> Result<usize, TransferError>;

    /// `None` when the backend cannot report usage.
    fn storage_usage(&self) -> Option<StorageUsage>;
}

fn is_pending(task: &TransferTask) -> bool {
    !task.status.is_terminal()
}

fn cutoff(now: u64, max_age_days: u32) -> u64 {
    now.saturating_sub(u64::from(max_age_days) * SECS_PER_DAY)
}

/// Ids become file names and key segments; keep them to a safe alphabet.
fn validate_id(id: &str) -> Result<(), TransferError> {
    let ok = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(TransferError::StorageUnavailable(format!(
            "transfer id {id:?} cannot be stored"
        )))
    }
}

fn encode_task(task: &TransferTask) -> Result<Vec<u8>, TransferError> {
    serde_json::to_vec_pretty(task).map_err(|e| {
        TransferError::StorageUnavailable(format!("serializing task {}: {e}", task.id))
    })
}

fn io_error(context: impl std::fmt::Display, err: std::io::Error) -> TransferError {
    if err.kind() == std::io::ErrorKind::StorageFull {
        TransferError::StorageFull(format!("{context}: {err}"))
    } else {
        TransferError::StorageUnavailable(format!("{context}: {err}"))
    }
}

/// Dispatch enum selecting a store backend at runtime from config.
pub enum StoreBackend {
    Memory(MemoryStore),
    Fs(FsStore),
    #[cfg(feature = "rocksdb")]
    Rocks(RocksStore),
}

impl StoreBackend {
    pub fn open(cfg: &StateConfig) -> Result<Self, TransferError> {
        match cfg.backend {
            StateKind::Memory => Ok(Self::Memory(MemoryStore::with_quota(cfg.max_bytes))),
            StateKind::Fs => Ok(Self::Fs(FsStore::open(
                &expand_tilde(&cfg.path),
                cfg.max_bytes,
            )?)),
            #[cfg(feature = "rocksdb")]
            StateKind::Rocksdb => Ok(Self::Rocks(RocksStore::open(&expand_tilde(&cfg.path))?)),
            #[cfg(not(feature = "rocksdb"))]
            StateKind::Rocksdb => {
                tracing::warn!(
                    "RocksDB not compiled in (missing 'rocksdb' feature), falling back to fs backend"
                );
                Ok(Self::Fs(FsStore::open(&expand_tilde(&cfg.path), cfg.max_bytes)?))
            }
        }
    }

    fn inner(&self) -> &dyn TransferStore {
        match self {
            Self::Memory(s) => s,
            Self::Fs(s) => s,
            #[cfg(feature = "rocksdb")]
            Self::Rocks(s) => s,
        }
    }
}

impl TransferStore for StoreBackend {
    fn save_task(&self, task: &TransferTask) -> Result<(), TransferError> {
        self.inner().save_task(task)
    }

    fn get_task(&self, id: &str) -> Result<Option<TransferTask>, TransferError> {
        self.inner().get_task(id)
    }

    fn list_pending_tasks(&self) -> Result<Vec<TransferTask>, TransferError> {
        self.inner().list_pending_tasks()
    }

    fn delete_task(&self, id: &str) -> Result<(), TransferError> {
        self.inner().delete_task(id)
    }

    fn save_chunk(&self, task_id: &str, index: usize, data: &[u8]) -> Result<(), TransferError> {
        self.inner().save_chunk(task_id, index, data)
    }

    fn get_chunks(&self, task_id: &str) -> Result<BTreeMap<usize, Bytes>, TransferError> {
        self.inner().get_chunks(task_id)
    }

    fn get_chunk(&self, task_id: &str, index: usize) -> Result<Option<Bytes>, TransferError> {
        self.inner().get_chunk(task_id, index)
    }

    fn chunk_indices(&self, task_id: &str) -> Result<BTreeSet<usize>, TransferError> {
        self.inner().chunk_indices(task_id)
    }

    fn chunk_count(&self, task_id: &str) -> Result<usize, TransferError> {
        self.inner().chunk_count(task_id)
    }

    fn delete_chunks(&self, task_id: &str) -> Result<(), TransferError> {
        self.inner().delete_chunks(task_id)
    }

    fn cleanup_expired(&self, max_age_days: u32) -> Result<usize, TransferError> {
        self.inner().cleanup_expired(max_age_days)
    }

    fn storage_usage(&self) -> Option<StorageUsage> {
        self.inner().storage_usage()
    }
}
