//! Integration tests for the download path of the orchestrator.
//!
//! Resources are sealed into an in-memory OpenDAL operator; a recording
//! transport in front of it counts fetches per location and can hold chosen
//! locations until the task is cancelled.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use opendal::Operator;
use rcx_core::types::{
    unix_now, DestinationStrategy, KeyText, TransferSource, TransferStatus, TransferTask,
};
use rcx_core::{ErrorKind, TransferError};
use rcx_crypto::Algorithm;
use rcx_storage::{ChunkTransport, OperatorTransport, TransportError};
use rcx_transfer::{
    ChunkLocations, DirSinkFactory, DownloadRequest, FsStore, LocationError, LocationService,
    ManifestLocations, MemoryStore, Orchestrator, ProxyDownloader, SinkOutput, StorageUsage,
    TransferContext, TransferEvent, TransferStore, UploadRequest, UploadTicket,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const PREFIX: &str = "it";

fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Counts fetches per location; locations in `held_back` never complete
/// until their fetch is cancelled.
struct Recorder {
    inner: OperatorTransport,
    fetches: Mutex<HashMap<String, usize>>,
    held_back: Mutex<HashSet<String>>,
}

impl Recorder {
    fn new(op: &Operator) -> Self {
        Self {
            inner: OperatorTransport::new(op.clone()),
            fetches: Mutex::default(),
            held_back: Mutex::default(),
        }
    }

    fn hold_back(&self, locations: &[String]) {
        self.held_back
            .lock()
            .unwrap()
            .extend(locations.iter().cloned());
    }

    fn release_all(&self) {
        self.held_back.lock().unwrap().clear();
    }

    fn fetches(&self, location: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(location)
            .copied()
            .unwrap_or(0)
    }
}

impl ChunkTransport for Recorder {
    fn fetch<'a>(
        &'a self,
        location: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Bytes, TransportError>> {
        Box::pin(async move {
            *self
                .fetches
                .lock()
                .unwrap()
                .entry(location.to_string())
                .or_default() += 1;
            let held = self.held_back.lock().unwrap().contains(location);
            if held {
                cancel.cancelled().await;
                return Err(TransportError::Cancelled);
            }
            self.inner.fetch(location, cancel).await
        })
    }

    fn submit<'a>(
        &'a self,
        location: &'a str,
        data: Bytes,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        self.inner.submit(location, data, cancel)
    }
}

struct Fixture {
    op: Operator,
    svc: ManifestLocations,
    transport: Arc<Recorder>,
    store: Arc<MemoryStore>,
}

impl Fixture {
    fn new() -> Self {
        let op = memory_operator();
        Self {
            svc: ManifestLocations::new(op.clone(), PREFIX),
            transport: Arc::new(Recorder::new(&op)),
            store: Arc::new(MemoryStore::new()),
            op,
        }
    }

    fn context(&self) -> TransferContext {
        let mut ctx = TransferContext::new(
            self.store.clone(),
            self.transport.clone(),
            Arc::new(self.svc.clone()),
        );
        ctx.config.retry_delay_ms = 1;
        ctx
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.context())
    }

    async fn seal(&self, data: &[u8], chunk_size: usize) -> (String, String) {
        self.svc
            .publish_sealed("data.bin", "application/octet-stream", data, chunk_size, Algorithm::Aes256Gcm)
            .await
            .expect("seal")
    }

    async fn locations(&self, hash: &str) -> Vec<String> {
        self.svc
            .locate(&TransferSource::Owned, hash)
            .await
            .expect("locate")
            .locations
    }
}

async fn wait_for_progress(
    events: &mut broadcast::Receiver<TransferEvent>,
    id: &str,
    completed: usize,
) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(TransferEvent::Progress { id: ev, progress }) = events.recv().await {
                if ev == id && progress.completed_chunks >= completed {
                    return;
                }
            }
        }
    })
    .await
    .expect("progress event");
}

fn drain(events: &mut broadcast::Receiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn resume_after_restart_fetches_only_missing_chunks() {
    let fx = Fixture::new();
    let data = sample(5 * 1000 - 123);
    // State a previous process left behind: 2 of 5 chunks persisted,
    // task still marked as downloading.
    let id = "download-restart";
    let locations = interrupted_task(
        &fx,
        fx.store.as_ref(),
        id,
        &data,
        1000,
        2,
        DestinationStrategy::InMemory,
    )
    .await;
    assert_eq!(locations.len(), 5);

    let orch = fx.orchestrator();
    assert_eq!(orch.restore().await.unwrap(), vec![id.to_string()]);
    assert_eq!(orch.task(id).unwrap().status, TransferStatus::Paused);
    assert_eq!(orch.progress(id).unwrap().completed_chunks, 2);

    orch.resume(id).await.unwrap();
    assert_eq!(orch.wait(id).await.unwrap(), TransferStatus::Completed);

    assert_eq!(fx.transport.fetches(&locations[0]), 0);
    assert_eq!(fx.transport.fetches(&locations[1]), 0);
    for location in &locations[2..] {
        assert_eq!(fx.transport.fetches(location), 1, "{location}");
    }
    assert_eq!(orch.take_output(id), Some(SinkOutput::Memory(Bytes::from(data))));
    assert_eq!(fx.store.chunk_count(id).unwrap(), 0);
}

#[tokio::test]
async fn pause_keeps_fetched_chunks_and_resume_finishes() {
    let fx = Fixture::new();
    let data = sample(5 * 512);
    let (hash, _) = fx.seal(&data, 512).await;
    let locations = fx.locations(&hash).await;
    fx.transport.hold_back(&locations[3..]);

    let orch = fx.orchestrator();
    let mut events = orch.subscribe();
    let id = orch
        .start_download(DownloadRequest::owned(&hash))
        .await
        .unwrap();
    wait_for_progress(&mut events, &id, 3).await;

    orch.pause(&id).await.unwrap();
    assert_eq!(orch.task(&id).unwrap().status, TransferStatus::Paused);
    assert_eq!(fx.store.chunk_count(&id).unwrap(), 3);
    assert_eq!(
        fx.store.get_task(&id).unwrap().unwrap().status,
        TransferStatus::Paused
    );
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, TransferEvent::Failed { .. })));

    fx.transport.release_all();
    orch.resume(&id).await.unwrap();
    assert_eq!(orch.wait(&id).await.unwrap(), TransferStatus::Completed);
    for location in &locations[..3] {
        assert_eq!(fx.transport.fetches(location), 1, "{location}");
    }
    assert_eq!(orch.take_output(&id), Some(SinkOutput::Memory(Bytes::from(data))));
}

#[tokio::test]
async fn cancel_clears_state_without_failure() {
    let fx = Fixture::new();
    let (hash, _) = fx.seal(&sample(4096), 1024).await;
    let locations = fx.locations(&hash).await;
    fx.transport.hold_back(&locations);

    let orch = fx.orchestrator();
    let mut events = orch.subscribe();
    let id = orch
        .start_download(DownloadRequest::owned(&hash))
        .await
        .unwrap();
    orch.cancel(&id).await.unwrap();

    assert_eq!(orch.wait(&id).await.unwrap(), TransferStatus::Cancelled);
    assert!(fx.store.get_task(&id).unwrap().is_none());
    assert_eq!(fx.store.chunk_count(&id).unwrap(), 0);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        TransferEvent::StatusChanged { status: TransferStatus::Cancelled, .. }
    )));
    assert!(!events
        .iter()
        .any(|e| matches!(e, TransferEvent::Failed { .. })));

    // Cancelled tasks can be retried from scratch.
    fx.transport.release_all();
    orch.retry(&id).await.unwrap();
    assert_eq!(orch.wait(&id).await.unwrap(), TransferStatus::Completed);
}

#[tokio::test]
async fn tampered_chunk_fails_then_retry_recovers() {
    let fx = Fixture::new();
    let data = sample(3000);
    let (hash, _) = fx.seal(&data, 1000).await;
    let locations = fx.locations(&hash).await;

    let original = fx.op.read(&locations[1]).await.unwrap().to_vec();
    let mut tampered = original.clone();
    tampered[24] ^= 0x5a;
    fx.op.write(&locations[1], tampered).await.unwrap();

    let orch = fx.orchestrator();
    let mut events = orch.subscribe();
    let id = orch
        .start_download(DownloadRequest::owned(&hash))
        .await
        .unwrap();
    assert_eq!(orch.wait(&id).await.unwrap(), TransferStatus::Failed);

    let failure = orch.task(&id).unwrap().failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::DecryptionFailed);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        TransferEvent::Failed { kind: ErrorKind::DecryptionFailed, .. }
    )));
    // Persisted so the failure survives a restart.
    let stored = fx.store.get_task(&id).unwrap().unwrap();
    assert_eq!(stored.status, TransferStatus::Failed);

    fx.op.write(&locations[1], original).await.unwrap();
    orch.retry(&id).await.unwrap();
    assert_eq!(orch.wait(&id).await.unwrap(), TransferStatus::Completed);
    // The bad chunk was fetched again rather than reused.
    assert_eq!(fx.transport.fetches(&locations[1]), 2);
    assert_eq!(orch.take_output(&id), Some(SinkOutput::Memory(Bytes::from(data))));
}

#[tokio::test]
async fn missing_chunk_is_network_failure() {
    let fx = Fixture::new();
    let (hash, _) = fx.seal(&sample(4000), 1000).await;
    let locations = fx.locations(&hash).await;
    fx.op.delete(&locations[3]).await.unwrap();

    let orch = fx.orchestrator();
    let id = orch
        .start_download(DownloadRequest::owned(&hash))
        .await
        .unwrap();
    assert_eq!(orch.wait(&id).await.unwrap(), TransferStatus::Failed);
    let failure = orch.task(&id).unwrap().failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::NetworkFailure);
    assert!(failure.message.contains("[3]"), "{}", failure.message);
}

#[tokio::test]
async fn streaming_download_writes_file() {
    let fx = Fixture::new();
    let out = tempfile::tempdir().unwrap();
    let data = sample(7 * 300 + 11);
    let (hash, _) = fx.seal(&data, 300).await;

    let ctx = fx
        .context()
        .with_sinks(Arc::new(DirSinkFactory::new(out.path())));
    let orch = Orchestrator::new(ctx);
    let id = orch
        .start_download(DownloadRequest {
            force_strategy: Some(DestinationStrategy::Streaming),
            ..DownloadRequest::owned(&hash)
        })
        .await
        .unwrap();
    assert_eq!(orch.wait(&id).await.unwrap(), TransferStatus::Completed);

    let path = out.path().join("data.bin");
    assert_eq!(orch.take_output(&id), Some(SinkOutput::File(path.clone())));
    assert_eq!(std::fs::read(&path).unwrap(), data);
    assert_eq!(fx.store.chunk_count(&id).unwrap(), 0);
}

#[tokio::test]
async fn streaming_pause_leaves_no_partial_file() {
    let fx = Fixture::new();
    let out = tempfile::tempdir().unwrap();
    let data = sample(6 * 256);
    let (hash, _) = fx.seal(&data, 256).await;
    let locations = fx.locations(&hash).await;
    // Ring order starts at the last chunk; hold back a middle one.
    fx.transport.hold_back(&locations[2..3]);

    let orch = Orchestrator::new(
        fx.context()
            .with_sinks(Arc::new(DirSinkFactory::new(out.path()))),
    );
    let mut events = orch.subscribe();
    let id = orch
        .start_download(DownloadRequest {
            force_strategy: Some(DestinationStrategy::Streaming),
            ..DownloadRequest::owned(&hash)
        })
        .await
        .unwrap();
    wait_for_progress(&mut events, &id, 3).await;
    orch.pause(&id).await.unwrap();
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);

    fx.transport.release_all();
    orch.resume(&id).await.unwrap();
    assert_eq!(orch.wait(&id).await.unwrap(), TransferStatus::Completed);
    assert_eq!(std::fs::read(out.path().join("data.bin")).unwrap(), data);
}

struct FixedProxy(Bytes);

impl ProxyDownloader for FixedProxy {
    fn download<'a>(
        &'a self,
        _source: &'a TransferSource,
        _resource_hash: &'a str,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Bytes, TransportError>> {
        let data = self.0.clone();
        Box::pin(async move { Ok(data) })
    }
}

#[tokio::test]
async fn shared_source_falls_back_to_proxy() {
    let fx = Fixture::new();
    let payload = Bytes::from_static(b"shared file body");
    let orch = Orchestrator::new(
        fx.context()
            .with_proxy(Arc::new(FixedProxy(payload.clone()))),
    );
    let share = TransferSource::PublicShare {
        share_code: "s3cr3t".into(),
    };

    // Size unknown: decided at start.
    let id = orch
        .start_download(DownloadRequest {
            source: share.clone(),
            ..DownloadRequest::owned("shared-hash")
        })
        .await
        .unwrap();
    assert_eq!(orch.wait(&id).await.unwrap(), TransferStatus::Completed);
    assert_eq!(orch.task(&id).unwrap().strategy, DestinationStrategy::Proxy);
    assert_eq!(orch.take_output(&id), Some(SinkOutput::Memory(payload.clone())));

    // Size known: chunked first, switched once locations are refused.
    let id = orch
        .start_download(DownloadRequest {
            source: share,
            file_size: Some(payload.len() as u64),
            file_name: Some("shared.txt".into()),
            ..DownloadRequest::owned("shared-hash")
        })
        .await
        .unwrap();
    assert_eq!(orch.wait(&id).await.unwrap(), TransferStatus::Completed);
    let task = orch.task(&id).unwrap();
    assert_eq!(task.strategy, DestinationStrategy::Proxy);
    assert_eq!(task.file_name, "shared.txt");
}

#[tokio::test]
async fn shared_source_without_proxy_fails() {
    let fx = Fixture::new();
    let orch = fx.orchestrator();
    let err = orch
        .start_download(DownloadRequest {
            source: TransferSource::PrivateShare {
                share_code: "x".into(),
            },
            ..DownloadRequest::owned("h")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Location(_)), "{err}");
}

#[tokio::test]
async fn restore_sweeps_expired_tasks() {
    let fx = Fixture::new();
    let old = TransferTask::new_download(
        "download-ancient",
        "h",
        "old.bin",
        Some(1),
        TransferSource::Owned,
        DestinationStrategy::InMemory,
        unix_now() - 30 * 86_400,
    );
    fx.store.save_task(&old).unwrap();
    fx.store.save_chunk(&old.id, 0, b"stale").unwrap();

    let orch = fx.orchestrator();
    assert!(orch.restore().await.unwrap().is_empty());
    assert!(fx.store.get_task(&old.id).unwrap().is_none());
    assert_eq!(fx.store.chunk_count(&old.id).unwrap(), 0);
}

/// Counts how chunk bytes are read back from the wrapped store.
#[derive(Default)]
struct ReadCounting {
    inner: MemoryStore,
    bulk_reads: AtomicUsize,
    single_reads: AtomicUsize,
}

impl TransferStore for ReadCounting {
    fn save_task(&self, task: &TransferTask) -> Result<(), TransferError> {
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

    fn get_chunks(&self, task_id: &str) -> Result<BTreeMap<usize, Bytes>, TransferError> {
        self.bulk_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_chunks(task_id)
    }

    fn get_chunk(&self, task_id: &str, index: usize) -> Result<Option<Bytes>, TransferError> {
        self.single_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_chunk(task_id, index)
    }

    fn chunk_indices(&self, task_id: &str) -> Result<BTreeSet<usize>, TransferError> {
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

    fn storage_usage(&self) -> Option<StorageUsage> {
        self.inner.storage_usage()
    }
}

/// A task a previous process left mid-download, with the first `held`
/// chunks already persisted.
async fn interrupted_task(
    fx: &Fixture,
    store: &dyn TransferStore,
    id: &str,
    data: &[u8],
    chunk_size: usize,
    held: usize,
    strategy: DestinationStrategy,
) -> Vec<String> {
    let (hash, key) = fx.seal(data, chunk_size).await;
    let locations = fx.locations(&hash).await;
    let mut task = TransferTask::new_download(
        id,
        &hash,
        "data.bin",
        Some(data.len() as u64),
        TransferSource::Owned,
        strategy,
        unix_now(),
    );
    task.total_chunks = locations.len();
    task.chunk_locations = locations.clone();
    task.locations_issued_at = Some(unix_now());
    task.initial_key = Some(KeyText::new(key));
    task.status = TransferStatus::Downloading;
    store.save_task(&task).unwrap();
    for (index, location) in locations.iter().enumerate().take(held) {
        let raw = fx.op.read(location).await.unwrap().to_vec();
        store.save_chunk(id, index, &raw).unwrap();
    }
    locations
}

#[tokio::test]
async fn streaming_resume_reads_held_chunks_one_at_a_time() {
    let fx = Fixture::new();
    let out = tempfile::tempdir().unwrap();
    let store = Arc::new(ReadCounting::default());
    let data = sample(6 * 400 - 7);
    let id = "download-stream-resume";
    let locations = interrupted_task(
        &fx,
        store.as_ref(),
        id,
        &data,
        400,
        3,
        DestinationStrategy::Streaming,
    )
    .await;

    let mut ctx = TransferContext::new(
        store.clone(),
        fx.transport.clone(),
        Arc::new(fx.svc.clone()),
    )
    .with_sinks(Arc::new(DirSinkFactory::new(out.path())));
    ctx.config.retry_delay_ms = 1;
    let orch = Orchestrator::new(ctx);
    assert_eq!(orch.restore().await.unwrap(), vec![id.to_string()]);
    orch.resume(id).await.unwrap();
    assert_eq!(orch.wait(id).await.unwrap(), TransferStatus::Completed);

    assert_eq!(std::fs::read(out.path().join("data.bin")).unwrap(), data);
    assert_eq!(store.bulk_reads.load(Ordering::SeqCst), 0);
    assert_eq!(store.single_reads.load(Ordering::SeqCst), 3);
    for location in &locations[..3] {
        assert_eq!(fx.transport.fetches(location), 0, "{location}");
    }
    for location in &locations[3..] {
        assert_eq!(fx.transport.fetches(location), 1, "{location}");
    }
}

/// Manifest locations that count renewals.
struct Renewing {
    inner: ManifestLocations,
    renewals: AtomicUsize,
}

impl LocationService for Renewing {
    fn locate<'a>(
        &'a self,
        source: &'a TransferSource,
        resource_hash: &'a str,
    ) -> BoxFuture<'a, Result<ChunkLocations, LocationError>> {
        self.inner.locate(source, resource_hash)
    }

    fn renew<'a>(
        &'a self,
        source: &'a TransferSource,
        resource_hash: &'a str,
    ) -> BoxFuture<'a, Result<ChunkLocations, LocationError>> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        self.inner.renew(source, resource_hash)
    }

    fn begin_upload<'a>(
        &'a self,
        request: &'a UploadRequest,
    ) -> BoxFuture<'a, Result<UploadTicket, LocationError>> {
        self.inner.begin_upload(request)
    }

    fn complete_upload<'a>(&'a self, upload_id: &'a str) -> BoxFuture<'a, Result<(), LocationError>> {
        self.inner.complete_upload(upload_id)
    }
}

#[tokio::test]
async fn expired_locations_are_renewed_and_held_chunks_kept() {
    let fx = Fixture::new();
    let data = sample(5 * 700);
    let id = "download-expired";
    let locations = interrupted_task(
        &fx,
        fx.store.as_ref(),
        id,
        &data,
        700,
        2,
        DestinationStrategy::InMemory,
    )
    .await;

    // Issued two days ago and pointing at URLs that no longer answer.
    let mut task = fx.store.get_task(id).unwrap().unwrap();
    task.locations_issued_at = Some(unix_now() - 2 * 86_400);
    task.chunk_locations = (0..locations.len()).map(|i| format!("expired/{i}")).collect();
    fx.store.save_task(&task).unwrap();

    let service = Arc::new(Renewing {
        inner: fx.svc.clone(),
        renewals: AtomicUsize::new(0),
    });
    let mut ctx = TransferContext::new(fx.store.clone(), fx.transport.clone(), service.clone());
    ctx.config.retry_delay_ms = 1;
    let orch = Orchestrator::new(ctx);
    orch.restore().await.unwrap();
    orch.resume(id).await.unwrap();
    assert_eq!(orch.wait(id).await.unwrap(), TransferStatus::Completed);

    assert_eq!(service.renewals.load(Ordering::SeqCst), 1);
    let task = orch.task(id).unwrap();
    assert_eq!(task.chunk_locations, locations);
    assert!(task.locations_issued_at.unwrap() + 60 >= unix_now());
    for i in 0..locations.len() {
        assert_eq!(fx.transport.fetches(&format!("expired/{i}")), 0);
    }
    assert_eq!(fx.transport.fetches(&locations[0]), 0);
    assert_eq!(fx.transport.fetches(&locations[1]), 0);
    for location in &locations[2..] {
        assert_eq!(fx.transport.fetches(location), 1, "{location}");
    }
    assert_eq!(orch.take_output(id), Some(SinkOutput::Memory(Bytes::from(data))));
}

#[tokio::test]
async fn storage_full_fails_then_retry_keeps_held_chunks() {
    let fx = Fixture::new();
    let state = tempfile::tempdir().unwrap();
    let data = sample(4 * 1000);
    let (hash, _) = fx.seal(&data, 1000).await;
    let locations = fx.locations(&hash).await;
    let mut sizes = Vec::new();
    for location in &locations {
        sizes.push(fx.op.read(location).await.unwrap().len() as u64);
    }
    let (min, max) = (*sizes.iter().min().unwrap(), *sizes.iter().max().unwrap());
    // Room for two chunks, never three.
    let quota = 2 * max + min / 2;

    let context = |store: Arc<FsStore>| {
        let mut ctx = TransferContext::new(store, fx.transport.clone(), Arc::new(fx.svc.clone()));
        ctx.config.retry_delay_ms = 1;
        ctx.config.concurrency = 1;
        ctx
    };
    let orch = Orchestrator::new(context(Arc::new(
        FsStore::open(state.path(), Some(quota)).unwrap(),
    )));
    let id = orch
        .start_download(DownloadRequest::owned(&hash))
        .await
        .unwrap();
    assert_eq!(orch.wait(&id).await.unwrap(), TransferStatus::Failed);
    let failure = orch.task(&id).unwrap().failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::StorageFull);
    drop(orch);

    // Space freed; a new process picks the failed task up again.
    let store = Arc::new(FsStore::open(state.path(), None).unwrap());
    assert_eq!(store.chunk_indices(&id).unwrap(), BTreeSet::from([0, 1]));
    let orch = Orchestrator::new(context(store.clone()));
    assert_eq!(orch.restore().await.unwrap(), vec![id.clone()]);
    assert_eq!(orch.task(&id).unwrap().status, TransferStatus::Failed);
    orch.retry(&id).await.unwrap();
    assert_eq!(orch.wait(&id).await.unwrap(), TransferStatus::Completed);

    assert_eq!(fx.transport.fetches(&locations[0]), 1);
    assert_eq!(fx.transport.fetches(&locations[1]), 1);
    assert_eq!(fx.transport.fetches(&locations[2]), 2);
    assert_eq!(orch.take_output(&id), Some(SinkOutput::Memory(Bytes::from(data))));
    assert_eq!(store.chunk_count(&id).unwrap(), 0);
}
