//! Transfer orchestrator: per-task state machine and run loops
//!
//! ```text
//! pending ─► downloading/uploading ◄─► paused
//!                   │
//!                   ├─► completed
//!                   ├─► failed ─────┐
//!                   └─► cancelled ──┴─► (retry) downloading/uploading
//! ```
//!
//! Every task gets at most one run loop at a time. Control operations on a
//! task (`pause`, `resume`, `cancel`, `retry`, `remove`) serialize on a
//! per-task async lock and wait for the loop they stop to exit.

mod download;
mod upload;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use rcx_core::config::{clamp_concurrency, RcxConfig, StrategyConfig, TransferConfig};
use rcx_core::types::{
    unix_now, DestinationStrategy, TaskFailure, TransferDirection, TransferProgress,
    TransferSource, TransferStatus, TransferTask,
};
use rcx_core::TransferError;
use rcx_storage::ChunkTransport;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collab::{ChunkLocations, LocationError, LocationService, ProxyDownloader};
use crate::events::TransferEvent;
use crate::metrics::TransferMetrics;
use crate::store::TransferStore;
use crate::strategy::{select_strategy, Capabilities};
use crate::writer::{SinkFactory, SinkOutput};

pub use download::decrypt_ring;

const EVENT_CAPACITY: usize = 1024;

/// Everything a set of transfers shares. Built by the caller and handed to
/// [`Orchestrator::new`].
#[derive(Clone)]
pub struct TransferContext {
    pub store: Arc<dyn TransferStore>,
    pub transport: Arc<dyn ChunkTransport>,
    pub locations: Arc<dyn LocationService>,
    /// Present when the host can stream straight to storage.
    pub sinks: Option<Arc<dyn SinkFactory>>,
    pub proxy: Option<Arc<dyn ProxyDownloader>>,
    pub config: TransferConfig,
    pub strategy: StrategyConfig,
    /// Age after which `restore` sweeps persisted state.
    pub expiry_days: u32,
    pub metrics: Option<TransferMetrics>,
}

impl TransferContext {
    pub fn new(
        store: Arc<dyn TransferStore>,
        transport: Arc<dyn ChunkTransport>,
        locations: Arc<dyn LocationService>,
    ) -> Self {
        Self {
            store,
            transport,
            locations,
            sinks: None,
            proxy: None,
            config: TransferConfig::default(),
            strategy: StrategyConfig::default(),
            expiry_days: 7,
            metrics: None,
        }
    }

    pub fn with_sinks(mut self, sinks: Arc<dyn SinkFactory>) -> Self {
        self.sinks = Some(sinks);
        self
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn ProxyDownloader>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_config(mut self, config: &RcxConfig) -> Self {
        self.config = config.transfer.clone();
        self.strategy = config.strategy.clone();
        self.expiry_days = config.state.expiry_days;
        self
    }

    pub fn with_metrics(mut self, metrics: TransferMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: self.sinks.is_some(),
            proxy: self.proxy.is_some(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub resource_hash: String,
    pub source: TransferSource,
    /// Defaults to the name the location service reports.
    pub file_name: Option<String>,
    /// When unknown, the location service is asked before a strategy is
    /// chosen.
    pub file_size: Option<u64>,
    pub force_strategy: Option<DestinationStrategy>,
}

impl DownloadRequest {
    pub fn owned(resource_hash: impl Into<String>) -> Self {
        Self {
            resource_hash: resource_hash.into(),
            source: TransferSource::Owned,
            file_name: None,
            file_size: None,
            force_strategy: None,
        }
    }
}

/// Point-in-time view of one task.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task: TransferTask,
    pub progress: TransferProgress,
}

struct TaskSlot {
    task: TransferTask,
    progress: TransferProgress,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
    control: Arc<tokio::sync::Mutex<()>>,
    output: Option<SinkOutput>,
}

impl TaskSlot {
    fn new(task: TransferTask, progress: TransferProgress) -> Self {
        Self {
            task,
            progress,
            cancel: None,
            handle: None,
            control: Arc::default(),
            output: None,
        }
    }
}

/// Result of a run loop that finished its work.
struct Completion {
    bytes: u64,
    output: Option<SinkOutput>,
}

struct Shared {
    ctx: TransferContext,
    slots: Mutex<HashMap<String, TaskSlot>>,
    events: broadcast::Sender<TransferEvent>,
    concurrency: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransferEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn task(&self, id: &str) -> Result<TransferTask, TransferError> {
        self.lock()
            .get(id)
            .map(|slot| slot.task.clone())
            .ok_or_else(|| TransferError::NotFound(id.to_string()))
    }

    fn concurrency(&self) -> usize {
        self.concurrency.load(Ordering::Relaxed)
    }

    /// Apply `f` to the in-memory task and persist the result. The store
    /// write happens after the slot lock is released.
    fn update_task(
        &self,
        id: &str,
        f: impl FnOnce(&mut TransferTask),
    ) -> Result<TransferTask, TransferError> {
        let snapshot = {
            let mut slots = self.lock();
            let slot = slots
                .get_mut(id)
                .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
            f(&mut slot.task);
            slot.task.clone()
        };
        self.ctx.store.save_task(&snapshot)?;
        Ok(snapshot)
    }

    fn set_status(&self, id: &str, status: TransferStatus) -> Result<(), TransferError> {
        self.update_task(id, |t| t.status = status)?;
        self.emit(TransferEvent::StatusChanged {
            id: id.to_string(),
            status,
        });
        Ok(())
    }

    fn report_progress(&self, id: &str, completed: usize, total: usize, bytes: u64) {
        let progress = TransferProgress {
            completed_chunks: completed,
            total_chunks: total,
            bytes,
        };
        if let Some(slot) = self.lock().get_mut(id) {
            slot.progress = progress;
        }
        self.emit(TransferEvent::Progress {
            id: id.to_string(),
            progress,
        });
    }

    fn finish_completed(
        &self,
        id: &str,
        direction: TransferDirection,
        done: Completion,
        started: Instant,
    ) {
        if let Err(e) = self.ctx.store.delete_chunks(id) {
            tracing::warn!(task_id = %id, "purging chunk data failed: {e}");
        }
        // Output first: anyone who sees `Completed` can take it.
        if let Some(slot) = self.lock().get_mut(id) {
            slot.progress.completed_chunks = slot.progress.total_chunks;
            slot.progress.bytes = done.bytes;
            slot.output = done.output.clone();
        }
        let saved = self.update_task(id, |t| {
            t.status = TransferStatus::Completed;
            t.completed_at = Some(unix_now());
            t.failure = None;
        });
        if let Err(e) = saved {
            tracing::warn!(task_id = %id, "persisting completed task failed: {e}");
            if let Some(slot) = self.lock().get_mut(id) {
                slot.task.status = TransferStatus::Completed;
            }
        }
        if let Some(m) = &self.ctx.metrics {
            m.transfer_finished(direction, "completed");
            m.observe_duration(direction, started.elapsed().as_secs_f64());
        }
        tracing::info!(
            task_id = %id,
            bytes = done.bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "transfer completed"
        );
        self.emit(TransferEvent::StatusChanged {
            id: id.to_string(),
            status: TransferStatus::Completed,
        });
        self.emit(TransferEvent::Completed {
            id: id.to_string(),
            bytes: done.bytes,
            output: done.output,
        });
    }

    fn finish_failed(&self, id: &str, direction: TransferDirection, err: &TransferError) {
        let failure = TaskFailure {
            kind: err.kind(),
            message: err.to_string(),
        };
        tracing::error!(task_id = %id, kind = ?failure.kind, "transfer failed: {err}");
        let saved = self.update_task(id, |t| {
            t.status = TransferStatus::Failed;
            t.failure = Some(failure.clone());
        });
        if let Err(e) = saved {
            tracing::warn!(task_id = %id, "persisting failed task failed: {e}");
            if let Some(slot) = self.lock().get_mut(id) {
                slot.task.status = TransferStatus::Failed;
                slot.task.failure = Some(failure.clone());
            }
        }
        if let Some(m) = &self.ctx.metrics {
            m.transfer_finished(direction, "failed");
        }
        self.emit(TransferEvent::StatusChanged {
            id: id.to_string(),
            status: TransferStatus::Failed,
        });
        self.emit(TransferEvent::Failed {
            id: id.to_string(),
            kind: failure.kind,
            message: failure.message,
        });
    }
}

async fn run(shared: Arc<Shared>, id: String, cancel: CancellationToken) {
    let direction = match shared.task(&id) {
        Ok(task) => task.direction,
        Err(e) => {
            tracing::warn!(task_id = %id, "run started for unknown task: {e}");
            return;
        }
    };
    let started = Instant::now();
    let result = match direction {
        TransferDirection::Download => download::run(&shared, &id, &cancel).await,
        TransferDirection::Upload => upload::run(&shared, &id, &cancel).await,
    };
    match result {
        Ok(done) => shared.finish_completed(&id, direction, done, started),
        Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
            tracing::debug!(task_id = %id, "run stopped: {e}");
        }
        Err(e) => shared.finish_failed(&id, direction, &e),
    }
}

/// Owns every transfer of a process. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(ctx: TransferContext) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let concurrency = AtomicUsize::new(ctx.config.clamped_concurrency());
        Self {
            shared: Arc::new(Shared {
                ctx,
                slots: Mutex::new(HashMap::new()),
                events,
                concurrency,
            }),
        }
    }

    pub fn context(&self) -> &TransferContext {
        &self.shared.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.shared.events.subscribe()
    }

    pub fn task(&self, id: &str) -> Option<TransferTask> {
        self.shared.task(id).ok()
    }

    pub fn progress(&self, id: &str) -> Option<TransferProgress> {
        self.shared.lock().get(id).map(|slot| slot.progress)
    }

    /// Every known task, oldest first.
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<TaskSnapshot> = self
            .shared
            .lock()
            .values()
            .map(|slot| TaskSnapshot {
                task: slot.task.clone(),
                progress: slot.progress,
            })
            .collect();
        all.sort_by(|a, b| {
            a.task
                .created_at
                .cmp(&b.task.created_at)
                .then_with(|| a.task.id.cmp(&b.task.id))
        });
        all
    }

    /// Output of a completed download. Taking it frees the buffer.
    pub fn take_output(&self, id: &str) -> Option<SinkOutput> {
        self.shared.lock().get_mut(id).and_then(|slot| slot.output.take())
    }

    pub fn concurrency(&self) -> usize {
        self.shared.concurrency()
    }

    /// Applies to runs started after the call. Returns the clamped value.
    pub fn set_concurrency(&self, n: usize) -> usize {
        let n = clamp_concurrency(n);
        self.shared.concurrency.store(n, Ordering::Relaxed);
        n
    }

    fn control(&self, id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, TransferError> {
        self.shared
            .lock()
            .get(id)
            .map(|slot| slot.control.clone())
            .ok_or_else(|| TransferError::NotFound(id.to_string()))
    }

    fn invalid(&self, id: &str, operation: &'static str, status: TransferStatus) -> TransferError {
        TransferError::InvalidState {
            id: id.to_string(),
            operation,
            status: status.to_string(),
        }
    }

    /// Start a run loop. Caller holds the task's control lock.
    fn launch(&self, id: &str) -> Result<(), TransferError> {
        let task = self.shared.update_task(id, |t| {
            t.status = t.direction.active_status();
            t.failure = None;
        })?;
        self.shared.emit(TransferEvent::StatusChanged {
            id: id.to_string(),
            status: task.status,
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(self.shared.clone(), id.to_string(), cancel.clone()));
        if let Some(slot) = self.shared.lock().get_mut(id) {
            slot.cancel = Some(cancel);
            slot.handle = Some(handle);
        }
        Ok(())
    }

    /// Cancel the run loop, if any, and wait for it to exit.
    async fn stop_run(&self, id: &str) {
        let (cancel, handle) = match self.shared.lock().get_mut(id) {
            Some(slot) => (slot.cancel.take(), slot.handle.take()),
            None => (None, None),
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(task_id = %id, "run loop ended abnormally: {e}");
            }
        }
    }

    fn insert(&self, task: TransferTask, progress: TransferProgress) -> Result<(), TransferError> {
        self.shared.ctx.store.save_task(&task)?;
        let id = task.id.clone();
        let status = task.status;
        self.shared
            .lock()
            .insert(id.clone(), TaskSlot::new(task, progress));
        self.shared
            .emit(TransferEvent::StatusChanged { id, status });
        Ok(())
    }

    /// Create and start a download. Returns the task id.
    pub async fn start_download(&self, req: DownloadRequest) -> Result<String, TransferError> {
        let ctx = &self.shared.ctx;
        let caps = ctx.capabilities();
        let mut located: Option<ChunkLocations> = None;
        let mut proxied = false;
        let mut file_size = req.file_size;

        if file_size.is_none() && req.force_strategy.is_none() {
            match ctx.locations.locate(&req.source, &req.resource_hash).await {
                Ok(found) => {
                    file_size = found.file_size;
                    located = Some(found);
                }
                Err(LocationError::Unsupported(msg)) if caps.proxy => {
                    tracing::info!(resource = %req.resource_hash, "delegating to proxy: {msg}");
                    proxied = true;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let strategy = match req.force_strategy {
            Some(DestinationStrategy::Streaming) if !caps.streaming => {
                return Err(TransferError::Refused(
                    "streaming requested but no sink is available".into(),
                ))
            }
            Some(DestinationStrategy::Proxy) if !caps.proxy => {
                return Err(TransferError::Refused(
                    "proxy requested but no proxy is configured".into(),
                ))
            }
            Some(forced) => forced,
            None if proxied => DestinationStrategy::Proxy,
            None => select_strategy(file_size, caps, &ctx.strategy)?,
        };

        let id = format!("download-{}", uuid::Uuid::new_v4());
        let file_name = req
            .file_name
            .clone()
            .or_else(|| located.as_ref().map(|l| l.file_name.clone()))
            .unwrap_or_else(|| req.resource_hash.clone());
        let mut task = TransferTask::new_download(
            &id,
            &req.resource_hash,
            file_name,
            file_size,
            req.source.clone(),
            strategy,
            unix_now(),
        );
        if let Some(found) = &located {
            download::apply_locations(&mut task, found, unix_now());
        }
        let progress = TransferProgress::new(0, task.total_chunks);
        self.insert(task, progress)?;
        tracing::info!(
            task_id = %id,
            resource = %req.resource_hash,
            strategy = strategy.as_str(),
            "download started"
        );

        let control = self.control(&id)?;
        let _guard = control.lock().await;
        self.launch(&id)?;
        Ok(id)
    }

    /// Create and start an upload of the file at `path`. Returns the task id.
    pub async fn start_upload(&self, path: impl AsRef<Path>) -> Result<String, TransferError> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            TransferError::ResourceNotFound(format!("{}: {e}", path.display()))
        })?;
        if !meta.is_file() {
            return Err(TransferError::Refused(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let id = format!("upload-{}", uuid::Uuid::new_v4());
        let task = TransferTask::new_upload(
            &id,
            path.to_path_buf(),
            file_name,
            meta.len(),
            "application/octet-stream",
            self.shared.ctx.config.chunk_size,
            unix_now(),
        );
        let progress = TransferProgress::new(0, task.total_chunks);
        self.insert(task, progress)?;
        tracing::info!(task_id = %id, path = %path.display(), bytes = meta.len(), "upload started");

        let control = self.control(&id)?;
        let _guard = control.lock().await;
        self.launch(&id)?;
        Ok(id)
    }

    /// Stop the run loop and keep everything fetched so far.
    pub async fn pause(&self, id: &str) -> Result<(), TransferError> {
        let control = self.control(id)?;
        let _guard = control.lock().await;
        let status = self.shared.task(id)?.status;
        if !status.is_active() && status != TransferStatus::Pending {
            return Err(self.invalid(id, "pause", status));
        }
        self.stop_run(id).await;
        // The loop may have completed or failed before it saw the signal.
        let status = self.shared.task(id)?.status;
        if status.is_active() || status == TransferStatus::Pending {
            self.shared.set_status(id, TransferStatus::Paused)?;
            tracing::info!(task_id = %id, "transfer paused");
        }
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<(), TransferError> {
        let control = self.control(id)?;
        let _guard = control.lock().await;
        let status = self.shared.task(id)?.status;
        if status != TransferStatus::Paused {
            return Err(self.invalid(id, "resume", status));
        }
        tracing::info!(task_id = %id, "transfer resumed");
        self.launch(id)
    }

    /// Abort and discard all persisted state. The task stays visible as
    /// cancelled until removed.
    pub async fn cancel(&self, id: &str) -> Result<(), TransferError> {
        let control = self.control(id)?;
        let _guard = control.lock().await;
        let task = self.shared.task(id)?;
        if task.status.is_terminal() {
            return Err(self.invalid(id, "cancel", task.status));
        }
        self.stop_run(id).await;
        self.discard(&task).await?;
        if let Some(slot) = self.shared.lock().get_mut(id) {
            slot.task.status = TransferStatus::Cancelled;
            // The remote upload and its locations are gone; a retry starts over.
            slot.task.upload_id = None;
            slot.task.chunk_locations.clear();
            slot.task.locations_issued_at = None;
            slot.output = None;
        }
        if let Some(m) = &self.shared.ctx.metrics {
            m.transfer_finished(task.direction, "cancelled");
        }
        tracing::info!(task_id = %id, "transfer cancelled");
        self.shared.emit(TransferEvent::StatusChanged {
            id: id.to_string(),
            status: TransferStatus::Cancelled,
        });
        Ok(())
    }

    /// Restart a failed or cancelled task, reusing whatever is still
    /// persisted. After a crypto failure the held chunks are dropped and
    /// locations re-issued, since the same bytes would fail again.
    pub async fn retry(&self, id: &str) -> Result<(), TransferError> {
        let control = self.control(id)?;
        let _guard = control.lock().await;
        let task = self.shared.task(id)?;
        if !matches!(
            task.status,
            TransferStatus::Failed | TransferStatus::Cancelled
        ) {
            return Err(self.invalid(id, "retry", task.status));
        }
        if task.failure.as_ref().is_some_and(|f| f.kind.is_crypto()) {
            tracing::info!(task_id = %id, "dropping held chunks after crypto failure");
            self.shared.ctx.store.delete_chunks(id)?;
            self.shared.update_task(id, |t| {
                t.chunk_locations.clear();
                t.locations_issued_at = None;
            })?;
        }
        tracing::info!(task_id = %id, "transfer retried");
        self.launch(id)
    }

    /// Cancel if running, clear persisted state and forget the task.
    pub async fn remove(&self, id: &str) -> Result<(), TransferError> {
        let control = self.control(id)?;
        let _guard = control.lock().await;
        let task = self.shared.task(id)?;
        self.stop_run(id).await;
        if task.status == TransferStatus::Completed {
            self.shared.ctx.store.clear_all(id)?;
        } else {
            self.discard(&task).await?;
        }
        self.shared.lock().remove(id);
        tracing::debug!(task_id = %id, "transfer removed");
        Ok(())
    }

    async fn discard(&self, task: &TransferTask) -> Result<(), TransferError> {
        self.shared.ctx.store.clear_all(&task.id)?;
        if let Some(upload_id) = &task.upload_id {
            if let Err(e) = self.shared.ctx.locations.cancel_upload(upload_id).await {
                tracing::warn!(task_id = %task.id, "discarding remote upload failed: {e}");
            }
        }
        Ok(())
    }

    /// Drop completed and cancelled tasks from the history. Returns how many
    /// were dropped.
    pub fn clear_completed(&self) -> usize {
        let finished: Vec<String> = self
            .shared
            .lock()
            .iter()
            .filter(|(_, slot)| slot.task.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &finished {
            if let Err(e) = self.shared.ctx.store.delete_task(id) {
                tracing::warn!(task_id = %id, "deleting finished task failed: {e}");
            }
            self.shared.lock().remove(id);
        }
        finished.len()
    }

    /// Load persisted tasks after a restart. Expired state is swept first;
    /// interrupted tasks come back paused. Returns the ids loaded.
    pub async fn restore(&self) -> Result<Vec<String>, TransferError> {
        let store = &self.shared.ctx.store;
        let swept = store.cleanup_expired(self.shared.ctx.expiry_days)?;
        if swept > 0 {
            tracing::info!(swept, "expired transfers removed on restore");
        }
        let mut restored = Vec::new();
        for mut task in store.list_pending_tasks()? {
            if self.shared.lock().contains_key(&task.id) {
                continue;
            }
            if task.status.is_active() || task.status == TransferStatus::Pending {
                task.status = TransferStatus::Paused;
            }
            let held = store.chunk_count(&task.id)?;
            let progress = TransferProgress::new(held.min(task.total_chunks), task.total_chunks);
            tracing::debug!(task_id = %task.id, held, status = %task.status, "transfer restored");
            restored.push(task.id.clone());
            self.insert(task, progress)?;
        }
        Ok(restored)
    }

    /// Pause every running task.
    pub async fn shutdown(&self) {
        let running: Vec<String> = self
            .shared
            .lock()
            .iter()
            .filter(|(_, slot)| slot.task.status.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        for id in running {
            if let Err(e) = self.pause(&id).await {
                tracing::warn!(task_id = %id, "pausing on shutdown failed: {e}");
            }
        }
    }

    /// Wait until the task is no longer running and return its status.
    pub async fn wait(&self, id: &str) -> Result<TransferStatus, TransferError> {
        let mut events = self.subscribe();
        loop {
            let status = self.shared.task(id)?.status;
            if !status.is_active() && status != TransferStatus::Pending {
                return Ok(status);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(TransferError::NotFound(id.to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
