use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use rcx_core::types::{unix_now, TransferTask};
use rcx_core::TransferError;

use super::{cutoff, is_pending, StorageUsage, TransferStore};

/// Process-local store for tests and for hosts without durable storage.
/// Optional byte quota applies to chunk data.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    quota: Option<u64>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, TransferTask>,
    chunks: HashMap<String, ChunkSet>,
    used: u64,
}

struct ChunkSet {
    chunks: BTreeMap<usize, Bytes>,
    touched_at: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: Option<u64>) -> Self {
        Self {
            inner: Mutex::default(),
            quota,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TransferStore for MemoryStore {
    fn save_task(&self, task: &TransferTask) -> Result<(), TransferError> {
        self.lock().tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<TransferTask>, TransferError> {
        Ok(self.lock().tasks.get(id).cloned())
    }

    fn list_pending_tasks(&self) -> Result<Vec<TransferTask>, TransferError> {
        let mut tasks: Vec<TransferTask> = self
            .lock()
            .tasks
            .values()
            .filter(|t| is_pending(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn delete_task(&self, id: &str) -> Result<(), TransferError> {
        self.lock().tasks.remove(id);
        Ok(())
    }

    fn save_chunk(&self, task_id: &str, index: usize, data: &[u8]) -> Result<(), TransferError> {
        let mut inner = self.lock();
        let old = inner
            .chunks
            .get(task_id)
            .and_then(|set| set.chunks.get(&index))
            .map_or(0, |b| b.len() as u64);
        let used = inner.used - old + data.len() as u64;
        if let Some(quota) = self.quota {
            if used > quota {
                return Err(TransferError::StorageFull(format!(
                    "chunk {index} of {task_id} needs {} bytes; {} of {quota} in use",
                    data.len(),
                    inner.used
                )));
            }
        }
        inner.used = used;
        let set = inner
            .chunks
            .entry(task_id.to_string())
            .or_insert_with(|| ChunkSet {
                chunks: BTreeMap::new(),
                touched_at: 0,
            });
        set.chunks.insert(index, Bytes::copy_from_slice(data));
        set.touched_at = unix_now();
        Ok(())
    }

    fn get_chunks(&self, task_id: &str) -> Result<BTreeMap<usize, Bytes>, TransferError> {
        Ok(self
            .lock()
            .chunks
            .get(task_id)
            .map(|set| set.chunks.clone())
            .unwrap_or_default())
    }

    fn get_chunk(&self, task_id: &str, index: usize) -> Result<Option<Bytes>, TransferError> {
        Ok(self
            .lock()
            .chunks
            .get(task_id)
            .and_then(|set| set.chunks.get(&index).cloned()))
    }

    fn chunk_indices(&self, task_id: &str) -> Result<BTreeSet<usize>, TransferError> {
        Ok(self
            .lock()
            .chunks
            .get(task_id)
            .map(|set| set.chunks.keys().copied().collect())
            .unwrap_or_default())
    }

    fn chunk_count(&self, task_id: &str) -> Result<usize, TransferError> {
        Ok(self.lock().chunks.get(task_id).map_or(0, |s| s.chunks.len()))
    }

    fn delete_chunks(&self, task_id: &str) -> Result<(), TransferError> {
        let mut inner = self.lock();
        if let Some(set) = inner.chunks.remove(task_id) {
            let freed: u64 = set.chunks.values().map(|b| b.len() as u64).sum();
            inner.used -= freed;
        }
        Ok(())
    }

    fn cleanup_expired(&self, max_age_days: u32) -> Result<usize, TransferError> {
        let cutoff = cutoff(unix_now(), max_age_days);
        let expired: Vec<String> = {
            let inner = self.lock();
            let mut ids: Vec<String> = inner
                .tasks
                .values()
                .filter(|t| t.created_at < cutoff)
                .map(|t| t.id.clone())
                .collect();
            ids.extend(
                inner
                    .chunks
                    .iter()
                    .filter(|(id, set)| !inner.tasks.contains_key(*id) && set.touched_at < cutoff)
                    .map(|(id, _)| id.clone()),
            );
            ids
        };
        for id in &expired {
            self.clear_all(id)?;
        }
        if !expired.is_empty() {
            tracing::info!(swept = expired.len(), "expired transfer state removed");
        }
        Ok(expired.len())
    }

    fn storage_usage(&self) -> Option<StorageUsage> {
        Some(StorageUsage {
            used: self.lock().used,
            quota: self.quota,
        })
    }
}
