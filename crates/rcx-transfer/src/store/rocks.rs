//! RocksDB-backed store
//!
//! Keys: `task/<id>` holds the task JSON; `chunk/<id>/<index:010>` holds an
//! 8-byte big-endian write timestamp followed by the chunk bytes. Writes go
//! straight to RocksDB; its WAL handles durability.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use bytes::Bytes;
use rcx_core::types::{unix_now, TransferTask};
use rcx_core::TransferError;
use rocksdb::{Direction, IteratorMode, WriteBatch, DB};

use super::{cutoff, encode_task, is_pending, StorageUsage, TransferStore};

const TASK_PREFIX: &str = "task/";
const CHUNK_PREFIX: &str = "chunk/";
const STAMP_LEN: usize = 8;

pub struct RocksStore {
    db: DB,
}

fn db_error(context: impl std::fmt::Display, err: rocksdb::Error) -> TransferError {
    let message = format!("{context}: {err}");
    if message.contains("No space left") {
        TransferError::StorageFull(message)
    } else {
        TransferError::StorageUnavailable(message)
    }
}

fn chunk_prefix(task_id: &str) -> String {
    format!("{CHUNK_PREFIX}{task_id}/")
}

impl RocksStore {
    /// Open or create a RocksDB store at the given path.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)
            .map_err(|e| db_error(format_args!("opening RocksDB {}", path.display()), e))?;
        Ok(Self { db })
    }

    /// All `(key, value)` pairs under `prefix`, in key order.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Box<[u8]>)>, TransferError> {
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| db_error("iterating RocksDB", e))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            out.push((String::from_utf8_lossy(&key).into_owned(), value));
        }
        Ok(out)
    }

    fn tasks(&self) -> Result<Vec<TransferTask>, TransferError> {
        let mut tasks = Vec::new();
        for (key, value) in self.scan(TASK_PREFIX)? {
            match serde_json::from_slice::<TransferTask>(&value) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!(key, "skipping unreadable task: {e}"),
            }
        }
        Ok(tasks)
    }
}

impl TransferStore for RocksStore {
    fn save_task(&self, task: &TransferTask) -> Result<(), TransferError> {
        let key = format!("{TASK_PREFIX}{}", task.id);
        self.db
            .put(key.as_bytes(), encode_task(task)?)
            .map_err(|e| db_error(format_args!("writing {key}"), e))
    }

    fn get_task(&self, id: &str) -> Result<Option<TransferTask>, TransferError> {
        let key = format!("{TASK_PREFIX}{id}");
        let Some(bytes) = self
            .db
            .get(key.as_bytes())
            .map_err(|e| db_error(format_args!("reading {key}"), e))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| TransferError::StorageUnavailable(format!("parsing {key}: {e}")))
    }

    fn list_pending_tasks(&self) -> Result<Vec<TransferTask>, TransferError> {
        let mut tasks: Vec<TransferTask> =
            self.tasks()?.into_iter().filter(is_pending).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn delete_task(&self, id: &str) -> Result<(), TransferError> {
        let key = format!("{TASK_PREFIX}{id}");
        self.db
            .delete(key.as_bytes())
            .map_err(|e| db_error(format_args!("deleting {key}"), e))
    }

    fn save_chunk(&self, task_id: &str, index: usize, data: &[u8]) -> Result<(), TransferError> {
        let key = format!("{}{index:010}", chunk_prefix(task_id));
        let mut value = Vec::with_capacity(STAMP_LEN + data.len());
        value.extend_from_slice(&unix_now().to_be_bytes());
        value.extend_from_slice(data);
        self.db
            .put(key.as_bytes(), value)
            .map_err(|e| db_error(format_args!("writing {key}"), e))
    }

    fn get_chunks(&self, task_id: &str) -> Result<BTreeMap<usize, Bytes>, TransferError> {
        let prefix = chunk_prefix(task_id);
        let mut chunks = BTreeMap::new();
        for (key, value) in self.scan(&prefix)? {
            let Ok(index) = key[prefix.len()..].parse::<usize>() else {
                continue;
            };
            if value.len() < STAMP_LEN {
                continue;
            }
            chunks.insert(index, Bytes::copy_from_slice(&value[STAMP_LEN..]));
        }
        Ok(chunks)
    }

    fn get_chunk(&self, task_id: &str, index: usize) -> Result<Option<Bytes>, TransferError> {
        let key = format!("{}{index:010}", chunk_prefix(task_id));
        let value = self
            .db
            .get(key.as_bytes())
            .map_err(|e| db_error(format_args!("reading {key}"), e))?;
        Ok(value
            .filter(|v| v.len() >= STAMP_LEN)
            .map(|v| Bytes::copy_from_slice(&v[STAMP_LEN..])))
    }

    fn chunk_indices(&self, task_id: &str) -> Result<BTreeSet<usize>, TransferError> {
        let prefix = chunk_prefix(task_id);
        let mut indices = BTreeSet::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(|e| db_error("iterating RocksDB", e))?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            if let Some(index) = std::str::from_utf8(&key[prefix.len()..])
                .ok()
                .and_then(|s| s.parse().ok())
            {
                indices.insert(index);
            }
        }
        Ok(indices)
    }

    fn chunk_count(&self, task_id: &str) -> Result<usize, TransferError> {
        Ok(self.scan(&chunk_prefix(task_id))?.len())
    }

    fn delete_chunks(&self, task_id: &str) -> Result<(), TransferError> {
        let mut batch = WriteBatch::default();
        for (key, _) in self.scan(&chunk_prefix(task_id))? {
            batch.delete(key.as_bytes());
        }
        self.db
            .write(batch)
            .map_err(|e| db_error(format_args!("deleting chunks of {task_id}"), e))
    }

    fn cleanup_expired(&self, max_age_days: u32) -> Result<usize, TransferError> {
        let cutoff = cutoff(unix_now(), max_age_days);
        let tasks = self.tasks()?;
        let mut swept = 0;
        for task in tasks.iter().filter(|t| t.created_at < cutoff) {
            self.clear_all(&task.id)?;
            swept += 1;
        }

        // Newest write stamp per chunk set without a task record.
        let mut orphans: HashMap<String, u64> = HashMap::new();
        for (key, value) in self.scan(CHUNK_PREFIX)? {
            let Some((id, _)) = key[CHUNK_PREFIX.len()..].rsplit_once('/') else {
                continue;
            };
            if tasks.iter().any(|t| t.id == id) {
                continue;
            }
            let stamp = value
                .get(..STAMP_LEN)
                .and_then(|b| <[u8; STAMP_LEN]>::try_from(b).ok())
                .map_or(0, u64::from_be_bytes);
            let newest = orphans.entry(id.to_string()).or_insert(0);
            *newest = (*newest).max(stamp);
        }
        for (id, newest) in orphans {
            if newest < cutoff {
                self.delete_chunks(&id)?;
                swept += 1;
            }
        }
        if swept > 0 {
            tracing::info!(swept, "expired transfer state removed");
        }
        Ok(swept)
    }

    fn storage_usage(&self) -> Option<StorageUsage> {
        None
    }
}
