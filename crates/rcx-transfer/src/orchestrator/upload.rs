//! Upload run loop: register, submit missing slices, finalize.

use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::Path;

use bytes::Bytes;
use rcx_core::types::unix_now;
use rcx_core::TransferError;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Completion, Shared};
use crate::collab::UploadRequest;
use crate::fetcher::{submit_all, FetchOptions, SubmitEvent};

const EVENT_BUFFER: usize = 64;

/// Slice `index` of a file cut into `chunk_size` pieces.
async fn read_slice(
    path: &Path,
    index: usize,
    chunk_size: u64,
    file_size: u64,
) -> std::io::Result<Bytes> {
    let offset = index as u64 * chunk_size;
    let len = chunk_size.min(file_size.saturating_sub(offset)) as usize;
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

fn read_error(path: &Path, err: std::io::Error) -> TransferError {
    TransferError::StorageUnavailable(format!("reading {}: {err}", path.display()))
}

pub(super) async fn run(
    shared: &Shared,
    id: &str,
    cancel: &CancellationToken,
) -> Result<Completion, TransferError> {
    let mut task = shared.task(id)?;
    let cfg = &shared.ctx.config;
    let Some(path) = task.local_path.clone() else {
        return Err(TransferError::Refused(format!("upload {id} has no source file")));
    };
    let expected = task.file_size.unwrap_or_default();
    let actual = tokio::fs::metadata(&path)
        .await
        .map_err(|e| read_error(&path, e))?
        .len();
    if actual != expected {
        return Err(TransferError::SizeMismatch { expected, actual });
    }
    let chunk_size = task.chunk_size.unwrap_or(cfg.chunk_size).max(1);
    let total = task.total_chunks;

    if task.upload_id.is_none()
        || task.locations_expired(unix_now(), cfg.location_ttl_secs, cfg.location_expiry_buffer_secs)
    {
        let request = UploadRequest {
            file_name: task.file_name.clone(),
            file_size: expected,
            content_type: task.content_type.clone(),
            chunk_size,
            total_chunks: total,
            upload_id: task.upload_id.clone(),
        };
        let ticket = shared.ctx.locations.begin_upload(&request).await?;
        if ticket.locations.len() != total {
            return Err(TransferError::Location(format!(
                "{} locations issued for {total} chunks",
                ticket.locations.len()
            )));
        }
        task = shared.update_task(id, |t| {
            t.upload_id = Some(ticket.upload_id.clone());
            t.chunk_locations = ticket.locations.clone();
            t.locations_issued_at = Some(unix_now());
        })?;
    }
    let Some(upload_id) = task.upload_id.clone() else {
        return Err(TransferError::Location("no upload id issued".into()));
    };

    // A recorded digest only counts if the slice on disk still matches it.
    let mut skip = BTreeSet::new();
    for (index, digest) in shared.ctx.store.get_chunks(id)? {
        if index >= total {
            continue;
        }
        let data = read_slice(&path, index, chunk_size, expected)
            .await
            .map_err(|e| read_error(&path, e))?;
        if rcx_crypto::content_hash(&data).as_bytes() == &digest[..] {
            skip.insert(index);
        } else {
            tracing::warn!(task_id = %id, index, "slice changed since it was submitted, resubmitting");
        }
    }
    tracing::debug!(task_id = %id, total, held = skip.len(), %upload_id, "upload running");
    shared.report_progress(id, skip.len(), total, 0);

    let mut options = FetchOptions::from_config(cfg, cancel.child_token());
    options.concurrency = shared.concurrency();
    let stop = options.cancel.clone();
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let source = path.as_path();

    let submit = async {
        let res = submit_all(
            shared.ctx.transport.as_ref(),
            &task.chunk_locations,
            &skip,
            &options,
            |index| read_slice(source, index, chunk_size, expected),
            &tx,
        )
        .await;
        drop(tx);
        res
    };
    let record = async move {
        let mut rx = rx;
        while let Some(event) = rx.recv().await {
            match event {
                SubmitEvent::Submitted { index, digest, .. } => {
                    if let Err(e) = shared.ctx.store.save_chunk(id, index, digest.as_bytes()) {
                        stop.cancel();
                        return Err(e);
                    }
                }
                SubmitEvent::Retrying { .. } => {
                    if let Some(m) = &shared.ctx.metrics {
                        m.chunk_retried();
                    }
                }
                SubmitEvent::Progress {
                    completed,
                    total,
                    bytes,
                } => shared.report_progress(id, completed, total, bytes),
            }
        }
        Ok(())
    };
    let (submitted, recorded) = tokio::join!(submit, record);
    recorded?;
    let summary = submitted?;
    tracing::debug!(
        task_id = %id,
        submitted = summary.transferred,
        retries = summary.retries,
        "all slices submitted"
    );

    shared.ctx.locations.complete_upload(&upload_id).await?;
    shared.update_task(id, |t| t.resource_hash = upload_id.clone())?;
    Ok(Completion {
        bytes: expected,
        output: None,
    })
}
