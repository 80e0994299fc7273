//! Download run loop: locate, fetch, persist, decrypt, deliver.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use rcx_core::types::{unix_now, DestinationStrategy, KeyText, TransferTask};
use rcx_core::TransferError;
use rcx_crypto::{ChainDecryptor, ChunkKey, CodecError};
use rcx_storage::TransportError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Completion, Shared};
use crate::collab::{ChunkLocations, LocationError};
use crate::fetcher::{fetch_stream, FetchEvent, FetchOptions, FetchOrder, ReadAhead};
use crate::writer::{OrderedWriter, SinkOutput};

const EVENT_BUFFER: usize = 64;

/// Attach a chunk index to a codec failure.
pub(crate) fn codec_error(err: CodecError, index: Option<usize>) -> TransferError {
    match err {
        CodecError::InvalidFrame(message) => TransferError::InvalidFrame { index, message },
        CodecError::InvalidKey(message) => TransferError::InvalidKey { index, message },
        CodecError::DecryptionFailed => TransferError::DecryptionFailed {
            index: index.unwrap_or_default(),
        },
        CodecError::BrokenKeyChain { index, reason } => {
            TransferError::BrokenKeyChain { index, reason }
        }
        CodecError::Encryption(message) => TransferError::InvalidFrame { index, message },
        CodecError::EmptyChain => TransferError::InvalidFrame {
            index: None,
            message: "resource has no chunks".into(),
        },
    }
}

/// Decrypt a complete set of raw frames (index order) into the file
/// plaintext.
pub fn decrypt_ring(
    frames: &[Bytes],
    initial_key: &ChunkKey,
    verify_hash: bool,
) -> Result<Vec<u8>, TransferError> {
    let mut chain = ChainDecryptor::new(frames.len(), initial_key.clone())
        .map_err(|e| codec_error(e, None))?
        .verify_hash(verify_hash);
    let mut plaintexts = vec![Vec::new(); frames.len()];
    while let Some(index) = chain.next_index() {
        plaintexts[index] = chain
            .accept(index, &frames[index])
            .map_err(|e| codec_error(e, Some(index)))?
            .plaintext;
    }
    Ok(plaintexts.concat())
}

/// Copy freshly issued locations and resource metadata onto the task.
pub(super) fn apply_locations(task: &mut TransferTask, found: &ChunkLocations, now: u64) {
    task.total_chunks = found.chunk_count();
    task.chunk_locations = found.locations.clone();
    task.locations_issued_at = Some(now);
    if let Some(key) = &found.initial_key {
        task.initial_key = Some(KeyText::new(key.clone()));
    }
    if task.file_size.is_none() {
        task.file_size = found.file_size;
    }
    task.content_type = found.content_type.clone();
}

fn transport_error(err: TransportError) -> TransferError {
    match err {
        TransportError::Cancelled => TransferError::Cancelled,
        other => TransferError::NetworkFailure {
            indices: Vec::new(),
            message: other.to_string(),
        },
    }
}

fn check_size(expected: Option<u64>, actual: u64) -> Result<(), TransferError> {
    match expected {
        Some(expected) if expected != actual => {
            Err(TransferError::SizeMismatch { expected, actual })
        }
        _ => Ok(()),
    }
}

pub(super) async fn run(
    shared: &Shared,
    id: &str,
    cancel: &CancellationToken,
) -> Result<Completion, TransferError> {
    let mut task = shared.task(id)?;
    if task.strategy == DestinationStrategy::Proxy {
        return proxy(shared, &task, cancel).await;
    }

    let cfg = &shared.ctx.config;
    if task.locations_expired(unix_now(), cfg.location_ttl_secs, cfg.location_expiry_buffer_secs) {
        let lookup = if task.locations_issued_at.is_some() {
            tracing::info!(task_id = %id, "chunk locations expired, renewing");
            shared.ctx.locations.renew(&task.source, &task.resource_hash).await
        } else {
            shared.ctx.locations.locate(&task.source, &task.resource_hash).await
        };
        match lookup {
            Ok(found) => {
                let before = task.total_chunks;
                if before != 0 && before != found.chunk_count() {
                    tracing::warn!(
                        task_id = %id,
                        before,
                        after = found.chunk_count(),
                        "chunk count changed, dropping held chunks"
                    );
                    shared.ctx.store.delete_chunks(id)?;
                }
                task = shared.update_task(id, |t| apply_locations(t, &found, unix_now()))?;
            }
            Err(LocationError::Unsupported(msg)) if shared.ctx.proxy.is_some() => {
                tracing::info!(task_id = %id, "switching to proxy download: {msg}");
                task = shared.update_task(id, |t| t.strategy = DestinationStrategy::Proxy)?;
                return proxy(shared, &task, cancel).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if task.total_chunks == 0 {
        return Err(codec_error(CodecError::EmptyChain, None));
    }
    let key = match &task.initial_key {
        Some(text) => ChunkKey::from_base64(text.expose()).map_err(|e| codec_error(e, None))?,
        None => {
            return Err(TransferError::InvalidKey {
                index: None,
                message: "no initial key issued for this resource".into(),
            })
        }
    };
    let held: BTreeSet<usize> = shared
        .ctx
        .store
        .chunk_indices(id)?
        .into_iter()
        .filter(|index| *index < task.total_chunks)
        .collect();
    tracing::debug!(
        task_id = %id,
        total = task.total_chunks,
        held = held.len(),
        strategy = task.strategy.as_str(),
        "download running"
    );

    let mut options = FetchOptions::from_config(cfg, cancel.child_token());
    options.concurrency = shared.concurrency();

    match (task.strategy, &shared.ctx.sinks) {
        (DestinationStrategy::Streaming, Some(_)) => {
            streaming(shared, &task, key, held, options).await
        }
        (DestinationStrategy::Streaming, None) => {
            tracing::warn!(task_id = %id, "no sink available, buffering in memory");
            in_memory(shared, &task, key, options).await
        }
        _ => in_memory(shared, &task, key, options).await,
    }
}

/// Bookkeeping shared by both chunked paths for each fetcher event.
/// Returns the chunk carried by the event, if any.
fn on_fetch_event(
    shared: &Shared,
    task: &TransferTask,
    event: FetchEvent,
) -> Result<Option<(usize, Bytes, bool)>, TransferError> {
    match event {
        FetchEvent::Held { index, bytes } => Ok(Some((index, bytes, false))),
        FetchEvent::Fetched { index, bytes } => {
            shared.ctx.store.save_chunk(&task.id, index, &bytes)?;
            if let Some(m) = &shared.ctx.metrics {
                m.chunk_fetched(bytes.len());
            }
            Ok(Some((index, bytes, true)))
        }
        FetchEvent::Retrying { .. } => {
            if let Some(m) = &shared.ctx.metrics {
                m.chunk_retried();
            }
            Ok(None)
        }
        FetchEvent::Progress {
            completed,
            total,
            bytes,
        } => {
            shared.report_progress(&task.id, completed, total, bytes);
            Ok(None)
        }
    }
}

/// Fetch everything, then decrypt the whole ring at once.
async fn in_memory(
    shared: &Shared,
    task: &TransferTask,
    key: ChunkKey,
    options: FetchOptions,
) -> Result<Completion, TransferError> {
    let total = task.total_chunks;
    let mut held = shared.ctx.store.get_chunks(&task.id)?;
    held.retain(|index, _| *index < total);
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let stop = options.cancel.clone();

    let fetch = async {
        let res = fetch_stream(
            shared.ctx.transport.as_ref(),
            &task.chunk_locations,
            &held,
            &options,
            &tx,
        )
        .await;
        drop(tx);
        res
    };
    let collect = async move {
        let mut rx = rx;
        let mut frames = BTreeMap::new();
        while let Some(event) = rx.recv().await {
            match on_fetch_event(shared, task, event) {
                Ok(Some((index, bytes, _))) => {
                    frames.insert(index, bytes);
                }
                Ok(None) => {}
                Err(e) => {
                    stop.cancel();
                    return Err(e);
                }
            }
        }
        Ok(frames)
    };
    let (fetched, collected) = tokio::join!(fetch, collect);
    let mut frames = collected?;
    fetched?;

    let frames: Vec<Bytes> = (0..total)
        .map(|index| {
            frames.remove(&index).ok_or_else(|| TransferError::NetworkFailure {
                indices: vec![index],
                message: "chunk missing after fetch".into(),
            })
        })
        .collect::<Result<_, _>>()?;

    let verify = shared.ctx.config.verify_hash;
    let plaintext = tokio::task::spawn_blocking(move || decrypt_ring(&frames, &key, verify))
        .await
        .map_err(|e| TransferError::InvalidFrame {
            index: None,
            message: format!("decrypt task panicked: {e}"),
        })??;

    let bytes = plaintext.len() as u64;
    check_size(task.file_size, bytes)?;
    Ok(Completion {
        bytes,
        output: Some(SinkOutput::Memory(Bytes::from(plaintext))),
    })
}

/// Raw chunks waiting for their turn in the ring, and whether each one
/// holds a read-ahead permit.
type Waiting = BTreeMap<usize, (Bytes, bool)>;

/// Decrypt and write every chunk the ring can take next. Chunks held from an
/// earlier run are read from the store one at a time as the cursor reaches
/// them. Returns the bytes of held chunks consumed.
async fn advance_ring(
    shared: &Shared,
    task: &TransferTask,
    chain: &mut ChainDecryptor,
    writer: &mut OrderedWriter,
    window: &ReadAhead,
    held: &BTreeSet<usize>,
    waiting: &mut Waiting,
) -> Result<u64, TransferError> {
    let mut held_bytes = 0;
    while let Some(next) = chain.next_index() {
        let (bytes, permit) = match waiting.remove(&next) {
            Some(entry) => entry,
            None if held.contains(&next) => {
                let bytes = shared.ctx.store.get_chunk(&task.id, next)?.ok_or_else(|| {
                    TransferError::StorageUnavailable(format!(
                        "chunk {next} of {} vanished from the store",
                        task.id
                    ))
                })?;
                held_bytes += bytes.len() as u64;
                (bytes, false)
            }
            None => break,
        };
        let step = chain
            .accept(next, &bytes)
            .map_err(|e| codec_error(e, Some(next)))
            .map(|chunk| chunk.plaintext);
        let written = match step {
            Ok(plaintext) => writer.write(next, plaintext).await.map_err(TransferError::from),
            Err(e) => Err(e),
        };
        if permit {
            window.release();
        }
        written?;
    }
    Ok(held_bytes)
}

/// Decrypt in ring order as chunks arrive and write through the ordered
/// writer. The fetcher runs ring-first with a read-ahead window so raw
/// chunks never pile up far ahead of the decryptor, and held chunks stay in
/// the store until their turn.
async fn streaming(
    shared: &Shared,
    task: &TransferTask,
    key: ChunkKey,
    held: BTreeSet<usize>,
    mut options: FetchOptions,
) -> Result<Completion, TransferError> {
    let Some(sinks) = shared.ctx.sinks.as_ref() else {
        return Err(TransferError::Sink("no sink factory configured".into()));
    };
    let total = task.total_chunks;
    let sink = sinks
        .create_sink(&task.file_name, &task.content_type)
        .await
        .map_err(|e| TransferError::Sink(format!("creating sink: {e}")))?;
    let mut writer = OrderedWriter::new(sink, total, shared.ctx.config.max_pending_chunks);
    let mut chain = ChainDecryptor::new(total, key)
        .map_err(|e| codec_error(e, None))?
        .verify_hash(shared.ctx.config.verify_hash);

    let window = ReadAhead::new(options.concurrency.max(1) * 2);
    options.order = FetchOrder::RingFirst;
    options.read_ahead = Some(window.clone());
    options.skip = held.clone();
    let stop = options.cancel.clone();
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let no_frames = BTreeMap::new();

    let fetch = async {
        let res = fetch_stream(
            shared.ctx.transport.as_ref(),
            &task.chunk_locations,
            &no_frames,
            &options,
            &tx,
        )
        .await;
        drop(tx);
        res
    };
    let consume = async {
        let mut rx = rx;
        let mut waiting = Waiting::new();
        let mut held_bytes = 0u64;
        let mut step = advance_ring(
            shared,
            task,
            &mut chain,
            &mut writer,
            &window,
            &held,
            &mut waiting,
        )
        .await;
        loop {
            match step {
                Ok(bytes) => held_bytes += bytes,
                Err(e) => {
                    stop.cancel();
                    return Err(e);
                }
            }
            let Some(event) = rx.recv().await else {
                break;
            };
            let event = match event {
                // Fetcher byte counts exclude chunks read from the store.
                FetchEvent::Progress {
                    completed,
                    total,
                    bytes,
                } => FetchEvent::Progress {
                    completed,
                    total,
                    bytes: bytes + held_bytes,
                },
                other => other,
            };
            step = match on_fetch_event(shared, task, event) {
                Ok(Some((index, bytes, permit))) => {
                    waiting.insert(index, (bytes, permit));
                    advance_ring(
                        shared,
                        task,
                        &mut chain,
                        &mut writer,
                        &window,
                        &held,
                        &mut waiting,
                    )
                    .await
                }
                Ok(None) => Ok(0),
                Err(e) => Err(e),
            };
        }
        // Held chunks after the last fetched one.
        advance_ring(
            shared,
            task,
            &mut chain,
            &mut writer,
            &window,
            &held,
            &mut waiting,
        )
        .await?;
        Ok(())
    };
    let (fetched, consumed) = tokio::join!(fetch, consume);
    let outcome = consumed.and(fetched.map_err(TransferError::from));

    if let Err(e) = outcome {
        if let Err(abort) = writer.abort().await {
            tracing::warn!(task_id = %task.id, "aborting sink failed: {abort}");
        }
        return Err(e);
    }
    if !chain.is_complete() {
        if let Err(abort) = writer.abort().await {
            tracing::warn!(task_id = %task.id, "aborting sink failed: {abort}");
        }
        return Err(TransferError::BrokenKeyChain {
            index: chain.next_index().unwrap_or_default(),
            reason: "ring incomplete after all chunks arrived".into(),
        });
    }

    let summary = writer.finish().await?;
    check_size(task.file_size, summary.bytes_written)?;
    Ok(Completion {
        bytes: summary.bytes_written,
        output: Some(summary.output),
    })
}

async fn proxy(
    shared: &Shared,
    task: &TransferTask,
    cancel: &CancellationToken,
) -> Result<Completion, TransferError> {
    let Some(proxy) = shared.ctx.proxy.as_ref() else {
        return Err(TransferError::Refused(
            "proxy download selected but no proxy is configured".into(),
        ));
    };
    tracing::debug!(task_id = %task.id, resource = %task.resource_hash, "proxy download running");
    let data = proxy
        .download(&task.source, &task.resource_hash, cancel)
        .await
        .map_err(transport_error)?;
    let bytes = data.len() as u64;
    check_size(task.file_size, bytes)?;
    shared.report_progress(&task.id, 1, 1, bytes);
    Ok(Completion {
        bytes,
        output: Some(SinkOutput::Memory(data)),
    })
}
