//! Bounded-concurrency chunk fetcher with per-chunk retry
//!
//! A fixed pool of workers drains a shared queue of chunk indices. Each
//! worker fetches one chunk at a time, retrying transient failures with
//! exponential backoff (`base * 2^attempt`). Results and progress flow to
//! the consumer as [`FetchEvent`]s on an mpsc channel, so the caller can
//! persist or decrypt each chunk the moment it lands.
//!
//! The same pool drives uploads through [`submit_all`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use rcx_core::config::{clamp_concurrency, TransferConfig};
use rcx_core::TransferError;
use rcx_storage::{ChunkTransport, TransportError};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Order in which chunk indices are handed to workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchOrder {
    /// 0, 1, …, N-1
    #[default]
    Sequential,
    /// N-1, 0, 1, …, N-2: the order a key ring is decrypted in.
    RingFirst,
}

impl FetchOrder {
    pub fn indices(self, total: usize) -> Vec<usize> {
        match self {
            Self::Sequential => (0..total).collect(),
            Self::RingFirst if total == 0 => Vec::new(),
            Self::RingFirst => std::iter::once(total - 1).chain(0..total - 1).collect(),
        }
    }
}

/// Limits how many fetched-but-unconsumed chunks may exist at once.
///
/// Workers take a permit before dequeuing an index; the consumer calls
/// [`ReadAhead::release`] once it has consumed a fetched chunk.
#[derive(Debug, Clone)]
pub struct ReadAhead {
    permits: Arc<Semaphore>,
}

impl ReadAhead {
    pub fn new(window: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(window.max(1))),
        }
    }

    pub fn release(&self) {
        self.permits.add_permits(1);
    }

    async fn acquire(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Clamped to 1..=10 when the pool starts.
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub order: FetchOrder,
    pub cancel: CancellationToken,
    pub read_ahead: Option<ReadAhead>,
    /// Indices the caller holds elsewhere. They count as completed but are
    /// neither fetched nor reported as events.
    pub skip: BTreeSet<usize>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            order: FetchOrder::Sequential,
            cancel: CancellationToken::new(),
            read_ahead: None,
            skip: BTreeSet::new(),
        }
    }
}

impl FetchOptions {
    pub fn from_config(cfg: &TransferConfig, cancel: CancellationToken) -> Self {
        Self {
            concurrency: cfg.clamped_concurrency(),
            max_retries: cfg.max_retries,
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
            cancel,
            ..Default::default()
        }
    }
}

/// Delay before retry number `attempt + 1`.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

#[derive(Debug, Clone)]
pub enum FetchEvent {
    /// Already persisted before this run; no network used.
    Held { index: usize, bytes: Bytes },
    Fetched { index: usize, bytes: Bytes },
    Retrying {
        index: usize,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Progress {
        completed: usize,
        total: usize,
        bytes: u64,
    },
}

#[derive(Debug, Clone)]
pub enum SubmitEvent {
    Submitted {
        index: usize,
        len: usize,
        /// base64url SHA-256 of the submitted slice.
        digest: String,
    },
    Retrying {
        index: usize,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Progress {
        completed: usize,
        total: usize,
        bytes: u64,
    },
}

/// One chunk that could not be transferred.
#[derive(Debug, Clone)]
pub struct ChunkFailure {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("chunk(s) {:?} failed: {}", failed_indices(.failures), first_error(.failures))]
    Failed { failures: Vec<ChunkFailure> },

    #[error("reading chunk {index} of the source failed: {message}")]
    Source { index: usize, message: String },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("event receiver closed")]
    ReceiverClosed,
}

fn failed_indices(failures: &[ChunkFailure]) -> Vec<usize> {
    failures.iter().map(|f| f.index).collect()
}

fn first_error(failures: &[ChunkFailure]) -> &str {
    failures.first().map_or("", |f| f.error.as_str())
}

impl FetchError {
    pub fn indices(&self) -> Vec<usize> {
        match self {
            Self::Failed { failures } => failed_indices(failures),
            Self::Source { index, .. } => vec![*index],
            Self::Cancelled | Self::ReceiverClosed => Vec::new(),
        }
    }
}

impl From<FetchError> for TransferError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled | FetchError::ReceiverClosed => TransferError::Cancelled,
            FetchError::Source { .. } => TransferError::StorageUnavailable(err.to_string()),
            FetchError::Failed { ref failures } => TransferError::NetworkFailure {
                indices: failed_indices(failures),
                message: first_error(failures).to_string(),
            },
        }
    }
}

/// Totals from one run of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub held: usize,
    pub transferred: usize,
    pub bytes: u64,
    pub retries: usize,
}

/// Fetch every location not already in `held` or `options.skip`, emitting
/// events as chunks arrive. Held chunks are reported first and cost no
/// network.
pub async fn fetch_stream(
    transport: &dyn ChunkTransport,
    locations: &[String],
    held: &BTreeMap<usize, Bytes>,
    options: &FetchOptions,
    events: &mpsc::Sender<FetchEvent>,
) -> Result<FetchSummary, FetchError> {
    let total = locations.len();
    let mut held_count = 0;
    let mut held_bytes = 0u64;
    for (&index, bytes) in held.range(..total) {
        held_count += 1;
        held_bytes += bytes.len() as u64;
        events
            .send(FetchEvent::Held {
                index,
                bytes: bytes.clone(),
            })
            .await
            .map_err(|_| FetchError::ReceiverClosed)?;
    }
    let skipped = options
        .skip
        .range(..total)
        .filter(|i| !held.contains_key(i))
        .count();
    if held_count + skipped > 0 {
        events
            .send(FetchEvent::Progress {
                completed: held_count + skipped,
                total,
                bytes: held_bytes,
            })
            .await
            .map_err(|_| FetchError::ReceiverClosed)?;
    }

    let queue: VecDeque<usize> = options
        .order
        .indices(total)
        .into_iter()
        .filter(|i| !held.contains_key(i) && !options.skip.contains(i))
        .collect();
    if queue.is_empty() {
        return Ok(FetchSummary {
            held: held_count,
            bytes: held_bytes,
            ..Default::default()
        });
    }
    tracing::debug!(
        total,
        held = held_count,
        pending = queue.len(),
        concurrency = clamp_concurrency(options.concurrency),
        "fetching chunks"
    );

    let completed = AtomicUsize::new(held_count + skipped);
    let bytes_total = AtomicU64::new(held_bytes);
    let retries = AtomicUsize::new(0);
    let (completed, bytes_total, retries) = (&completed, &bytes_total, &retries);

    let job = |index: usize| async move {
        let location = &locations[index];
        let bytes = with_retry(
            options,
            || transport.fetch(location, &options.cancel),
            |attempt, delay, err| {
                retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(index, attempt, ?delay, "chunk fetch failed, retrying: {err}");
                let _ = events.try_send(FetchEvent::Retrying {
                    index,
                    attempt,
                    delay,
                    error: err.to_string(),
                });
            },
        )
        .await
        .map_err(JobFailure::Transport)?;

        let len = bytes.len() as u64;
        let done = completed.fetch_add(1, Ordering::AcqRel) + 1;
        let sum = bytes_total.fetch_add(len, Ordering::AcqRel) + len;
        events
            .send(FetchEvent::Fetched { index, bytes })
            .await
            .map_err(|_| JobFailure::Closed)?;
        events
            .send(FetchEvent::Progress {
                completed: done,
                total,
                bytes: sum,
            })
            .await
            .map_err(|_| JobFailure::Closed)?;
        Ok::<(), JobFailure>(())
    };

    run_pool(queue, options, job).await?;
    Ok(FetchSummary {
        held: held_count,
        transferred: completed.load(Ordering::Acquire) - held_count - skipped,
        bytes: bytes_total.load(Ordering::Acquire),
        retries: retries.load(Ordering::Acquire),
    })
}

/// Fetch all locations and return their bytes in index order.
///
/// `events`, when given, receives the same stream [`fetch_stream`] emits.
pub async fn fetch_all(
    transport: &dyn ChunkTransport,
    locations: &[String],
    held: BTreeMap<usize, Bytes>,
    options: &FetchOptions,
    events: Option<mpsc::Sender<FetchEvent>>,
) -> Result<Vec<Bytes>, FetchError> {
    let (tx, mut rx) = mpsc::channel(clamp_concurrency(options.concurrency) * 4);
    let mut slots: Vec<Option<Bytes>> = vec![None; locations.len()];

    let fetch = async {
        let res = fetch_stream(transport, locations, &held, options, &tx).await;
        drop(tx);
        res
    };
    let collect = async {
        while let Some(event) = rx.recv().await {
            if let FetchEvent::Held { index, bytes } | FetchEvent::Fetched { index, bytes } = &event
            {
                slots[*index] = Some(bytes.clone());
            }
            if let Some(forward) = &events {
                let _ = forward.send(event).await;
            }
        }
    };
    let (res, ()) = tokio::join!(fetch, collect);
    res?;

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| FetchError::Failed {
                failures: vec![ChunkFailure {
                    index,
                    error: "chunk missing after fetch".into(),
                }],
            })
        })
        .collect()
}

/// Upload every index in `0..locations.len()` not in `skip`.
///
/// `read_chunk(index)` supplies the bytes for a chunk; it is called once per
/// attempt sequence, not per retry.
pub async fn submit_all<R, Fut>(
    transport: &dyn ChunkTransport,
    locations: &[String],
    skip: &BTreeSet<usize>,
    options: &FetchOptions,
    read_chunk: R,
    events: &mpsc::Sender<SubmitEvent>,
) -> Result<FetchSummary, FetchError>
where
    R: Fn(usize) -> Fut,
    Fut: Future<Output = std::io::Result<Bytes>>,
{
    let total = locations.len();
    let held = skip.range(..total).count();
    let queue: VecDeque<usize> = (0..total).filter(|i| !skip.contains(i)).collect();
    if queue.is_empty() {
        return Ok(FetchSummary {
            held,
            ..Default::default()
        });
    }

    let completed = AtomicUsize::new(held);
    let bytes_total = AtomicU64::new(0);
    let retries = AtomicUsize::new(0);
    let (completed, bytes_total, retries, read_chunk) =
        (&completed, &bytes_total, &retries, &read_chunk);

    let job = |index: usize| async move {
        let data = read_chunk(index).await.map_err(|e| JobFailure::Source(e.to_string()))?;
        let digest = rcx_crypto::content_hash(&data);
        let len = data.len();
        let location = &locations[index];
        with_retry(
            options,
            || transport.submit(location, data.clone(), &options.cancel),
            |attempt, delay, err| {
                retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(index, attempt, ?delay, "chunk submit failed, retrying: {err}");
                let _ = events.try_send(SubmitEvent::Retrying {
                    index,
                    attempt,
                    delay,
                    error: err.to_string(),
                });
            },
        )
        .await
        .map_err(JobFailure::Transport)?;

        let done = completed.fetch_add(1, Ordering::AcqRel) + 1;
        let sum = bytes_total.fetch_add(len as u64, Ordering::AcqRel) + len as u64;
        events
            .send(SubmitEvent::Submitted { index, len, digest })
            .await
            .map_err(|_| JobFailure::Closed)?;
        events
            .send(SubmitEvent::Progress {
                completed: done,
                total,
                bytes: sum,
            })
            .await
            .map_err(|_| JobFailure::Closed)?;
        Ok::<(), JobFailure>(())
    };

    run_pool(queue, options, job).await?;
    Ok(FetchSummary {
        held,
        transferred: completed.load(Ordering::Acquire) - held,
        bytes: bytes_total.load(Ordering::Acquire),
        retries: retries.load(Ordering::Acquire),
    })
}

async fn with_retry<T, Op, OpFut>(
    options: &FetchOptions,
    mut op: Op,
    mut on_retry: impl FnMut(u32, Duration, &TransportError),
) -> Result<T, TransportError>
where
    Op: FnMut() -> OpFut,
    OpFut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= options.max_retries => return Err(e),
            Err(e) => {
                let delay = retry_delay(options.retry_delay, attempt);
                attempt += 1;
                on_retry(attempt, delay, &e);
                tokio::select! {
                    biased;
                    _ = options.cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

enum JobFailure {
    Transport(TransportError),
    Source(String),
    Closed,
}

struct Pool<'a> {
    queue: Mutex<VecDeque<usize>>,
    failures: Mutex<Vec<ChunkFailure>>,
    source_error: Mutex<Option<(usize, String)>>,
    stop: AtomicBool,
    closed: AtomicBool,
    options: &'a FetchOptions,
}

async fn run_pool<F, Fut>(
    queue: VecDeque<usize>,
    options: &FetchOptions,
    job: F,
) -> Result<(), FetchError>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<(), JobFailure>>,
{
    let workers = clamp_concurrency(options.concurrency).min(queue.len());
    let pool = Pool {
        queue: Mutex::new(queue),
        failures: Mutex::new(Vec::new()),
        source_error: Mutex::new(None),
        stop: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        options,
    };

    futures::future::join_all((0..workers).map(|_| worker(&pool, &job))).await;

    if pool.closed.load(Ordering::Acquire) {
        return Err(FetchError::ReceiverClosed);
    }
    if options.cancel.is_cancelled() {
        return Err(FetchError::Cancelled);
    }
    if let Some((index, message)) = pool
        .source_error
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
    {
        return Err(FetchError::Source { index, message });
    }
    let mut failures = pool
        .failures
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner);
    if !failures.is_empty() {
        failures.sort_by_key(|f| f.index);
        return Err(FetchError::Failed { failures });
    }
    Ok(())
}

async fn worker<F, Fut>(pool: &Pool<'_>, job: &F)
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<(), JobFailure>>,
{
    let cancel = &pool.options.cancel;
    let read_ahead = pool.options.read_ahead.as_ref();
    loop {
        if pool.stop.load(Ordering::Acquire) || cancel.is_cancelled() {
            return;
        }
        // Permit before dequeue: the index a worker holds is always the
        // earliest one not yet handed out, so the consumer never starves.
        if let Some(window) = read_ahead {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = window.acquire() => {}
            }
        }
        let next = pool
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(index) = next else {
            if let Some(window) = read_ahead {
                window.release();
            }
            return;
        };

        match job(index).await {
            Ok(()) => {}
            Err(JobFailure::Transport(TransportError::Cancelled)) => return,
            Err(JobFailure::Closed) => {
                pool.closed.store(true, Ordering::Release);
                pool.stop.store(true, Ordering::Release);
                return;
            }
            Err(JobFailure::Source(message)) => {
                tracing::error!(index, "reading chunk source failed: {message}");
                *pool
                    .source_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some((index, message));
                pool.stop.store(true, Ordering::Release);
                return;
            }
            Err(JobFailure::Transport(err)) => {
                tracing::error!(index, "chunk transfer failed: {err}");
                pool.failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(ChunkFailure {
                        index,
                        error: err.to_string(),
                    });
                pool.stop.store(true, Ordering::Release);
                return;
            }
        }
    }
}
