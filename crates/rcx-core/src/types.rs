use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::ErrorKind;

/// Current time as unix seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }

    /// The status a task of this direction holds while its loop is running.
    pub fn active_status(self) -> TransferStatus {
        match self {
            Self::Upload => TransferStatus::Uploading,
            Self::Download => TransferStatus::Downloading,
        }
    }
}

/// Where the caller obtained access to the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferSource {
    Owned,
    PublicShare { share_code: String },
    PrivateShare { share_code: String },
}

impl TransferSource {
    pub fn is_shared(&self) -> bool {
        !matches!(self, Self::Owned)
    }
}

/// Lifecycle status of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Uploading,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl TransferStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Uploading | Self::Downloading)
    }

    /// Completed and cancelled tasks never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How downloaded plaintext reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStrategy {
    /// Buffer, decrypt, deliver a single byte blob.
    InMemory,
    /// Decrypt in chain order and write through an ordered sink.
    Streaming,
    /// Hand the whole download to the proxy collaborator.
    Proxy,
}

impl DestinationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InMemory => "in_memory",
            Self::Streaming => "streaming",
            Self::Proxy => "proxy",
        }
    }
}

/// Base64 key text persisted with a task.
///
/// Kept as text so the task record stays plain JSON; `Debug` never prints it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyText(String);

impl KeyText {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeyText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyText([REDACTED])")
    }
}

/// Failure recorded on a task that ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// The durable unit of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: String,
    pub direction: TransferDirection,
    pub resource_hash: String,
    pub file_name: String,
    /// `None` when the size is not known up front.
    pub file_size: Option<u64>,
    pub content_type: String,
    pub total_chunks: usize,
    /// Opaque, time-limited chunk locations, index-aligned with chunks.
    #[serde(default)]
    pub chunk_locations: Vec<String>,
    /// Unix seconds at which `chunk_locations` were issued.
    #[serde(default)]
    pub locations_issued_at: Option<u64>,
    #[serde(default)]
    pub initial_key: Option<KeyText>,
    pub source: TransferSource,
    pub status: TransferStatus,
    pub strategy: DestinationStrategy,
    /// Unix seconds.
    pub created_at: u64,
    #[serde(default)]
    pub completed_at: Option<u64>,
    /// Source file for uploads.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub failure: Option<TaskFailure>,
}

impl TransferTask {
    pub fn new_download(
        id: impl Into<String>,
        resource_hash: impl Into<String>,
        file_name: impl Into<String>,
        file_size: Option<u64>,
        source: TransferSource,
        strategy: DestinationStrategy,
        created_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            direction: TransferDirection::Download,
            resource_hash: resource_hash.into(),
            file_name: file_name.into(),
            file_size,
            content_type: "application/octet-stream".into(),
            total_chunks: 0,
            chunk_locations: Vec::new(),
            locations_issued_at: None,
            initial_key: None,
            source,
            status: TransferStatus::Pending,
            strategy,
            created_at,
            completed_at: None,
            local_path: None,
            upload_id: None,
            chunk_size: None,
            failure: None,
        }
    }

    pub fn new_upload(
        id: impl Into<String>,
        local_path: PathBuf,
        file_name: impl Into<String>,
        file_size: u64,
        content_type: impl Into<String>,
        chunk_size: u64,
        created_at: u64,
    ) -> Self {
        let total_chunks = file_size.div_ceil(chunk_size.max(1)) as usize;
        Self {
            id: id.into(),
            direction: TransferDirection::Upload,
            resource_hash: String::new(),
            file_name: file_name.into(),
            file_size: Some(file_size),
            content_type: content_type.into(),
            total_chunks,
            chunk_locations: Vec::new(),
            locations_issued_at: None,
            initial_key: None,
            source: TransferSource::Owned,
            status: TransferStatus::Pending,
            strategy: DestinationStrategy::Streaming,
            created_at,
            completed_at: None,
            local_path: Some(local_path),
            upload_id: None,
            chunk_size: Some(chunk_size),
            failure: None,
        }
    }

    /// Locations are stale once `ttl - buffer` seconds have elapsed since issue.
    pub fn locations_expired(&self, now: u64, ttl_secs: u64, buffer_secs: u64) -> bool {
        if self.chunk_locations.len() != self.total_chunks {
            return true;
        }
        match self.locations_issued_at {
            None => true,
            Some(issued) => now.saturating_sub(issued) >= ttl_secs.saturating_sub(buffer_secs),
        }
    }
}

/// Chunk-level progress of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub completed_chunks: usize,
    pub total_chunks: usize,
    pub bytes: u64,
}

impl TransferProgress {
    pub fn new(completed_chunks: usize, total_chunks: usize) -> Self {
        Self {
            completed_chunks,
            total_chunks,
            bytes: 0,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.completed_chunks as f64 / self.total_chunks as f64 * 100.0
    }
}
