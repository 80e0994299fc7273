//! Directory-backed store
//!
//! ```text
//! <root>/tasks/<id>.json
//! <root>/chunks/<id>/<index:08>.bin
//! ```
//!
//! Every file is written to a temp sibling and renamed into place, so a
//! crash never leaves a torn task record or chunk.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use rcx_core::types::{unix_now, TransferTask};
use rcx_core::TransferError;

use super::{cutoff, encode_task, io_error, is_pending, validate_id, StorageUsage, TransferStore};

pub struct FsStore {
    root: PathBuf,
    quota: Option<u64>,
    /// Bytes of chunk data on disk; also serializes chunk writes.
    used: Mutex<u64>,
}

impl FsStore {
    /// Open or create a store rooted at `root`.
    pub fn open(root: &Path, quota: Option<u64>) -> Result<Self, TransferError> {
        for dir in [root.join("tasks"), root.join("chunks")] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| io_error(format_args!("creating {}", dir.display()), e))?;
        }
        let used = dir_size(&root.join("chunks"))
            .map_err(|e| io_error(format_args!("measuring {}", root.display()), e))?;
        tracing::debug!(root = %root.display(), used, "opened transfer store");
        Ok(Self {
            root: root.to_path_buf(),
            quota,
            used: Mutex::new(used),
        })
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.root.join("tasks").join(format!("{id}.json"))
    }

    fn chunk_dir(&self, id: &str) -> PathBuf {
        self.root.join("chunks").join(id)
    }

    fn chunk_path(&self, id: &str, index: usize) -> PathBuf {
        self.chunk_dir(id).join(format!("{index:08}.bin"))
    }

    fn used(&self) -> MutexGuard<'_, u64> {
        self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_task(&self, path: &Path) -> Result<Option<TransferTask>, TransferError> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(format_args!("reading {}", path.display()), e)),
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            TransferError::StorageUnavailable(format!("parsing {}: {e}", path.display()))
        })
    }

    fn sweep_orphans(&self, cutoff: u64) -> Result<usize, TransferError> {
        let chunks_root = self.root.join("chunks");
        let entries = std::fs::read_dir(&chunks_root)
            .map_err(|e| io_error(format_args!("listing {}", chunks_root.display()), e))?;
        let mut swept = 0;
        for entry in entries.flatten() {
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if self.task_path(&id).exists() {
                continue;
            }
            let newest = newest_mtime(&entry.path()).unwrap_or(0);
            if newest < cutoff {
                tracing::debug!(id, "removing orphaned chunk set");
                self.delete_chunks(&id)?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

impl TransferStore for FsStore {
    fn save_task(&self, task: &TransferTask) -> Result<(), TransferError> {
        validate_id(&task.id)?;
        atomic_write(&self.task_path(&task.id), &encode_task(task)?)
    }

    fn get_task(&self, id: &str) -> Result<Option<TransferTask>, TransferError> {
        validate_id(id)?;
        self.read_task(&self.task_path(id))
    }

    fn list_pending_tasks(&self) -> Result<Vec<TransferTask>, TransferError> {
        let dir = self.root.join("tasks");
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| io_error(format_args!("listing {}", dir.display()), e))?;
        let mut tasks = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match self.read_task(&path) {
                Ok(Some(task)) if is_pending(&task) => tasks.push(task),
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %path.display(), "skipping unreadable task: {e}"),
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn delete_task(&self, id: &str) -> Result<(), TransferError> {
        validate_id(id)?;
        remove_if_exists(&self.task_path(id))
    }

    fn save_chunk(&self, task_id: &str, index: usize, data: &[u8]) -> Result<(), TransferError> {
        validate_id(task_id)?;
        let path = self.chunk_path(task_id, index);
        let mut used = self.used();
        let old = std::fs::metadata(&path).map_or(0, |m| m.len());
        let next = *used - old.min(*used) + data.len() as u64;
        if let Some(quota) = self.quota {
            if next > quota {
                return Err(TransferError::StorageFull(format!(
                    "chunk {index} of {task_id} needs {} bytes; {} of {quota} in use",
                    data.len(),
                    *used
                )));
            }
        }
        let dir = self.chunk_dir(task_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| io_error(format_args!("creating {}", dir.display()), e))?;
        atomic_write(&path, data)?;
        *used = next;
        Ok(())
    }

    fn get_chunks(&self, task_id: &str) -> Result<BTreeMap<usize, Bytes>, TransferError> {
        validate_id(task_id)?;
        let mut chunks = BTreeMap::new();
        for (index, path) in chunk_files(&self.chunk_dir(task_id))? {
            let data = std::fs::read(&path)
                .map_err(|e| io_error(format_args!("reading {}", path.display()), e))?;
            chunks.insert(index, Bytes::from(data));
        }
        Ok(chunks)
    }

    fn get_chunk(&self, task_id: &str, index: usize) -> Result<Option<Bytes>, TransferError> {
        validate_id(task_id)?;
        let path = self.chunk_path(task_id, index);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(format_args!("reading {}", path.display()), e)),
        }
    }

    fn chunk_indices(&self, task_id: &str) -> Result<BTreeSet<usize>, TransferError> {
        validate_id(task_id)?;
        Ok(chunk_files(&self.chunk_dir(task_id))?
            .into_iter()
            .map(|(index, _)| index)
            .collect())
    }

    fn chunk_count(&self, task_id: &str) -> Result<usize, TransferError> {
        validate_id(task_id)?;
        Ok(chunk_files(&self.chunk_dir(task_id))?.len())
    }

    fn delete_chunks(&self, task_id: &str) -> Result<(), TransferError> {
        validate_id(task_id)?;
        let dir = self.chunk_dir(task_id);
        let mut used = self.used();
        let freed = dir_size(&dir).unwrap_or(0);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(format_args!("removing {}", dir.display()), e)),
        }
        *used = used.saturating_sub(freed);
        Ok(())
    }

    fn cleanup_expired(&self, max_age_days: u32) -> Result<usize, TransferError> {
        let cutoff = cutoff(unix_now(), max_age_days);
        let dir = self.root.join("tasks");
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| io_error(format_args!("listing {}", dir.display()), e))?;

        let mut swept = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let task = match self.read_task(&path) {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "removing unreadable task: {e}");
                    remove_if_exists(&path)?;
                    continue;
                }
            };
            if task.created_at < cutoff {
                self.clear_all(&task.id)?;
                swept += 1;
            }
        }
        swept += self.sweep_orphans(cutoff)?;
        if swept > 0 {
            tracing::info!(swept, "expired transfer state removed");
        }
        Ok(swept)
    }

    fn storage_usage(&self) -> Option<StorageUsage> {
        Some(StorageUsage {
            used: *self.used(),
            quota: self.quota,
        })
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), TransferError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        io_error(format_args!("writing {}", tmp.display()), e)
    })?;
    std::fs::rename(&tmp, path).map_err(|e| io_error(format_args!("renaming {}", path.display()), e))
}

fn remove_if_exists(path: &Path) -> Result<(), TransferError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(format_args!("removing {}", path.display()), e)),
    }
}

/// `(index, path)` of every committed chunk file in `dir`.
fn chunk_files(dir: &Path) -> Result<Vec<(usize, PathBuf)>, TransferError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(format_args!("listing {}", dir.display()), e)),
    };
    let mut files: Vec<(usize, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension()? != "bin" {
                return None;
            }
            let index = path.file_stem()?.to_str()?.parse().ok()?;
            Some((index, path))
        })
        .collect();
    files.sort_by_key(|(index, _)| *index);
    Ok(files)
}

fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let meta = entry.metadata()?;
        total += if meta.is_dir() {
            dir_size(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}

fn newest_mtime(dir: &Path) -> Option<u64> {
    std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter_map(|e| e.metadata().ok()?.modified().ok())
        .filter_map(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .max()
}
