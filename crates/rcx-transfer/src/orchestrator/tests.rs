use super::*;
use crate::manifest::ManifestLocations;
use crate::store::MemoryStore;
use opendal::Operator;
use rcx_crypto::Algorithm;
use rcx_storage::OperatorTransport;

fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .unwrap()
        .finish()
}

fn orchestrator(op: &Operator, store: Arc<MemoryStore>) -> Orchestrator {
    let transport = Arc::new(OperatorTransport::new(op.clone()));
    let locations = Arc::new(ManifestLocations::new(op.clone(), "rcx"));
    let mut ctx = TransferContext::new(store, transport, locations);
    ctx.config.retry_delay_ms = 1;
    Orchestrator::new(ctx)
}

async fn seal(op: &Operator, data: &[u8], chunk_size: usize) -> String {
    ManifestLocations::new(op.clone(), "rcx")
        .publish_sealed("data.bin", "application/octet-stream", data, chunk_size, Algorithm::ChaCha20Poly1305)
        .await
        .unwrap()
        .0
}

#[tokio::test]
async fn test_download_completes_and_purges_chunks() {
    let op = memory_operator();
    let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let hash = seal(&op, &data, 4096).await;
    let store = Arc::new(MemoryStore::new());
    let orch = orchestrator(&op, store.clone());

    let id = orch.start_download(DownloadRequest::owned(&hash)).await.unwrap();
    assert!(id.starts_with("download-"));
    assert_eq!(orch.wait(&id).await.unwrap(), TransferStatus::Completed);

    let task = orch.task(&id).unwrap();
    assert_eq!(task.total_chunks, 3);
    assert_eq!(task.strategy, DestinationStrategy::InMemory);
    assert!(task.completed_at.is_some());
    assert_eq!(store.chunk_count(&id).unwrap(), 0);
    assert_eq!(orch.progress(&id).unwrap().completed_chunks, 3);

    let output = orch.take_output(&id).unwrap();
    assert_eq!(output, SinkOutput::Memory(bytes::Bytes::from(data)));
    assert!(orch.take_output(&id).is_none());
}

#[tokio::test]
async fn test_invalid_transitions_are_rejected() {
    let op = memory_operator();
    let hash = seal(&op, b"tiny", 16).await;
    let orch = orchestrator(&op, Arc::new(MemoryStore::new()));
    let id = orch.start_download(DownloadRequest::owned(hash)).await.unwrap();
    orch.wait(&id).await.unwrap();

    for err in [
        orch.resume(&id).await.unwrap_err(),
        orch.retry(&id).await.unwrap_err(),
        orch.pause(&id).await.unwrap_err(),
        orch.cancel(&id).await.unwrap_err(),
    ] {
        assert!(matches!(err, TransferError::InvalidState { .. }), "{err}");
    }
    assert!(matches!(
        orch.pause("download-nope").await,
        Err(TransferError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_unknown_resource_fails_start() {
    let op = memory_operator();
    let orch = orchestrator(&op, Arc::new(MemoryStore::new()));
    let err = orch
        .start_download(DownloadRequest::owned("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::ResourceNotFound(_)), "{err}");
    assert!(!err.to_string().contains("unknown transfer"));
    assert!(orch.tasks().is_empty());
}

#[tokio::test]
async fn test_forced_streaming_without_sink_refused() {
    let op = memory_operator();
    let orch = orchestrator(&op, Arc::new(MemoryStore::new()));
    let err = orch
        .start_download(DownloadRequest {
            force_strategy: Some(DestinationStrategy::Streaming),
            ..DownloadRequest::owned("h")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Refused(_)));
}

#[tokio::test]
async fn test_set_concurrency_clamps() {
    let orch = orchestrator(&memory_operator(), Arc::new(MemoryStore::new()));
    assert_eq!(orch.concurrency(), 3);
    assert_eq!(orch.set_concurrency(0), 1);
    assert_eq!(orch.set_concurrency(64), 10);
    assert_eq!(orch.concurrency(), 10);
}

#[tokio::test]
async fn test_clear_completed_keeps_failed() {
    let op = memory_operator();
    let hash = seal(&op, b"payload", 4).await;
    let store = Arc::new(MemoryStore::new());
    let orch = orchestrator(&op, store.clone());

    let done = orch.start_download(DownloadRequest::owned(&hash)).await.unwrap();
    orch.wait(&done).await.unwrap();

    // Break the ring for a second download of the same resource.
    let chunk = format!("rcx/chunks/{hash}/00000000");
    op.write(&chunk, b"garbage".to_vec()).await.unwrap();
    let failed = orch.start_download(DownloadRequest::owned(&hash)).await.unwrap();
    assert_eq!(orch.wait(&failed).await.unwrap(), TransferStatus::Failed);

    assert_eq!(orch.clear_completed(), 1);
    assert!(orch.task(&done).is_none());
    assert!(store.get_task(&done).unwrap().is_none());
    assert_eq!(orch.tasks().len(), 1);
    assert_eq!(orch.tasks()[0].task.id, failed);
}

/// Memory store whose next `save_task` parks until released.
#[derive(Default)]
struct GatedStore {
    inner: MemoryStore,
    gate: Mutex<Option<(std::sync::mpsc::Sender<()>, std::sync::mpsc::Receiver<()>)>>,
}

impl TransferStore for GatedStore {
    fn save_task(&self, task: &TransferTask) -> Result<(), TransferError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.send(()).unwrap();
            release.recv().unwrap();
        }
        self.inner.save_task(task)
    }

    fn get_task(&self, id: &str) -> Result<Option<TransferTask>, TransferError> {
        self.inner.get_task(id)
    }

    fn list_pending_tasks(&self) -> Result<Vec<TransferTask>, TransferError> {
        self.inner.list_pending_tasks()
    }

    fn delete_task(&self, id: &str) -> Result<(), TransferError> {
        self.inner.delete_task(id)
    }

    fn save_chunk(&self, task_id: &str, index: usize, data: &[u8]) -> Result<(), TransferError> {
        self.inner.save_chunk(task_id, index, data)
    }

    fn get_chunks(
        &self,
        task_id: &str,
    ) -> Result<std::collections::BTreeMap<usize, bytes::Bytes>, TransferError> {
        self.inner.get_chunks(task_id)
    }

    fn get_chunk(&self, task_id: &str, index: usize) -> Result<Option<bytes::Bytes>, TransferError> {
        self.inner.get_chunk(task_id, index)
    }

    fn chunk_indices(
        &self,
        task_id: &str,
    ) -> Result<std::collections::BTreeSet<usize>, TransferError> {
        self.inner.chunk_indices(task_id)
    }

    fn chunk_count(&self, task_id: &str) -> Result<usize, TransferError> {
        self.inner.chunk_count(task_id)
    }

    fn delete_chunks(&self, task_id: &str) -> Result<(), TransferError> {
        self.inner.delete_chunks(task_id)
    }

    fn cleanup_expired(&self, max_age_days: u32) -> Result<usize, TransferError> {
        self.inner.cleanup_expired(max_age_days)
    }

    fn storage_usage(&self) -> Option<crate::store::StorageUsage> {
        self.inner.storage_usage()
    }
}

#[test]
fn test_slow_task_write_does_not_block_readers() {
    let op = memory_operator();
    let store = Arc::new(GatedStore::default());
    let ctx = TransferContext::new(
        store.clone(),
        Arc::new(OperatorTransport::new(op.clone())),
        Arc::new(ManifestLocations::new(op, "rcx")),
    );
    let orch = Orchestrator::new(ctx);
    let task = TransferTask::new_download(
        "download-gated",
        "h",
        "a.bin",
        Some(1),
        TransferSource::Owned,
        DestinationStrategy::InMemory,
        unix_now(),
    );
    orch.insert(task, TransferProgress::new(0, 1)).unwrap();

    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    *store.gate.lock().unwrap() = Some((entered_tx, release_rx));

    let shared = orch.shared.clone();
    let writer = std::thread::spawn(move || {
        shared
            .update_task("download-gated", |t| t.status = TransferStatus::Paused)
            .unwrap()
    });
    entered_rx.recv().unwrap();

    // The write is parked inside the store; readers must still get through.
    let reader_orch = orch.clone();
    let (seen_tx, seen_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = seen_tx.send(reader_orch.task("download-gated").map(|t| t.status));
    });
    let seen = seen_rx
        .recv_timeout(std::time::Duration::from_secs(5))
        .expect("task read blocked behind a store write");
    assert_eq!(seen, Some(TransferStatus::Paused));

    release_tx.send(()).unwrap();
    assert_eq!(writer.join().unwrap().status, TransferStatus::Paused);
    assert_eq!(
        store.get_task("download-gated").unwrap().unwrap().status,
        TransferStatus::Paused
    );
}
